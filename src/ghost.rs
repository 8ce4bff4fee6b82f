//! # Ghost Packet Source
//!
//! Ghost packets mimic real radio receptions and are indistinguishable
//! downstream from them. The upstream loop tops its fetch batch up from a
//! [`PacketSource`] after draining the radio; [`UdpGhost`] is the bundled
//! implementation, a non-blocking UDP listener accepting raw payload
//! datagrams from a ghost-node sidecar.

use std::net::UdpSocket;
use std::time::Instant;

use log::{debug, info, warn};

use crate::error::FwdError;
use crate::hal::{Bandwidth, CodeRate, CrcStatus, DataRate, RxPacket, SpreadingFactor};

/// Metadata attached to injected receptions.
const GHOST_FREQ_HZ: u32 = 868_100_000;
const GHOST_RSSI: f32 = -66.0;
const GHOST_SNR: f32 = 7.0;

/// A source of injected receptions.
pub trait PacketSource: Send {
    /// Returns up to `max` pending packets without blocking.
    fn get(&mut self, max: usize) -> Vec<RxPacket>;
}

/// UDP listener presenting received datagrams as CRC-valid LoRa receptions.
pub struct UdpGhost {
    socket: UdpSocket,
    epoch: Instant,
}

impl UdpGhost {
    /// Binds the ghost listener. Errors here are soft: the caller logs and
    /// runs without a ghost stream.
    pub fn bind(address: &str, port: u16) -> Result<Self, FwdError> {
        let socket = UdpSocket::bind((address, port))?;
        socket.set_nonblocking(true)?;
        info!("[ghost] listening on {address}:{port}");
        Ok(UdpGhost {
            socket,
            epoch: Instant::now(),
        })
    }
}

impl PacketSource for UdpGhost {
    fn get(&mut self, max: usize) -> Vec<RxPacket> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        while out.len() < max {
            match self.socket.recv(&mut buf) {
                Ok(len) if len == 0 || len > 255 => {
                    warn!("[ghost] dropping datagram with unusable size {len}");
                }
                Ok(len) => {
                    debug!("[ghost] injected {len}-byte packet");
                    out.push(RxPacket {
                        count_us: self.epoch.elapsed().as_micros() as u32,
                        freq_hz: GHOST_FREQ_HZ,
                        if_chain: 0,
                        rf_chain: 0,
                        status: CrcStatus::CrcOk,
                        datarate: DataRate::Lora(SpreadingFactor::Sf7),
                        bandwidth: Bandwidth::Khz125,
                        coderate: CodeRate::Cr4_5,
                        rssi: GHOST_RSSI,
                        snr: GHOST_SNR,
                        payload: buf[..len].to_vec(),
                    });
                }
                // WouldBlock means the queue is drained; anything else is
                // logged and the stream keeps going.
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("[ghost] recv error: {e}");
                    break;
                }
            }
        }
        out
    }
}
