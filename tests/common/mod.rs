//! Shared helpers for the integration tests: a loopback "network server",
//! context construction around the mock HAL, and canned packets.

#![allow(dead_code)]

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lorafwd::config::{GatewayConfig, ServerConf};
use lorafwd::hal::mock::MockConcentrator;
use lorafwd::hal::{Bandwidth, CodeRate, CrcStatus, DataRate, RxPacket, SpreadingFactor};
use lorafwd::state::Context;
use lorafwd::transport::ServerEndpoint;

pub const GATEWAY_ID: u64 = 0xAA55_5A00_0000_0101;

/// A network server running on the loopback interface: one socket per
/// traffic direction, with bounded receives.
pub struct FakeServer {
    pub up: UdpSocket,
    pub down: UdpSocket,
}

impl FakeServer {
    pub fn start() -> FakeServer {
        let up = UdpSocket::bind("127.0.0.1:0").unwrap();
        let down = UdpSocket::bind("127.0.0.1:0").unwrap();
        up.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        down.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        FakeServer { up, down }
    }

    pub fn conf(&self) -> ServerConf {
        ServerConf {
            address: "127.0.0.1".into(),
            port_up: self.up.local_addr().unwrap().port(),
            port_down: self.down.local_addr().unwrap().port(),
        }
    }

    /// Connects a live endpoint to this server. A generous upstream timeout
    /// keeps acknowledgement tests robust under load.
    pub fn endpoint(&self) -> Arc<ServerEndpoint> {
        let endpoint = ServerEndpoint::connect(
            0,
            &self.conf(),
            Duration::from_millis(300),
            Duration::from_millis(200),
        );
        assert!(endpoint.is_live());
        Arc::new(endpoint)
    }

    pub fn recv_up(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 4096];
        match self.up.recv_from(&mut buf) {
            Ok((len, src)) => Some((buf[..len].to_vec(), src)),
            Err(_) => None,
        }
    }

    pub fn recv_down(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 4096];
        match self.down.recv_from(&mut buf) {
            Ok((len, src)) => Some((buf[..len].to_vec(), src)),
            Err(_) => None,
        }
    }
}

/// A configuration pointing at the fake server, radio stream on.
pub fn test_config(server: &FakeServer) -> GatewayConfig {
    GatewayConfig {
        gateway_id: GATEWAY_ID,
        servers: vec![server.conf()],
        ..GatewayConfig::default()
    }
}

/// Builds a context around a mock concentrator, keeping a handle on the
/// mock for scripting and inspection.
pub fn mock_context(config: GatewayConfig, gps_active: bool) -> (Arc<Context>, MockConcentrator) {
    let mock = MockConcentrator::new();
    let ctx = Context::new(config, Box::new(mock.clone()), gps_active);
    (ctx, mock)
}

/// The CRC-valid LoRa packet used across scenarios.
pub fn lora_packet() -> RxPacket {
    RxPacket {
        count_us: 0xD157_8C43,
        freq_hz: 868_300_000,
        if_chain: 2,
        rf_chain: 0,
        status: CrcStatus::CrcOk,
        datarate: DataRate::Lora(SpreadingFactor::Sf7),
        bandwidth: Bandwidth::Khz125,
        coderate: CodeRate::Cr4_5,
        rssi: -74.0,
        snr: 9.5,
        payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
