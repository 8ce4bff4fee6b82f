//! # Upstream Loop
//!
//! One loop shared by all servers. Each cycle fetches a batch from the radio
//! (topped up from the ghost source), applies the CRC forwarding policy,
//! serializes the survivors into one PUSH_DATA datagram, fans it out to
//! every live server and collects acknowledgements.

use std::io::ErrorKind;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{info, warn};

use crate::constants::{FETCH_SLEEP_MS, NB_PKT_MAX, PKT_PUSH_ACK};
use crate::error::FwdError;
use crate::ghost::PacketSource;
use crate::hal::{CrcStatus, RxPacket};
use crate::state::Context;
use crate::transport::ServerEndpoint;
use crate::wire::rxpk::{format_utc, PushBuffer};
use crate::wire::{check_ack, new_token, AckOutcome, GatewayId};

/// Runs upstream forwarding until shutdown. A HAL receive failure is fatal
/// and bubbles up to the caller.
pub fn upstream_loop(
    ctx: Arc<Context>,
    servers: Vec<Arc<ServerEndpoint>>,
    mut ghost: Option<Box<dyn PacketSource>>,
) -> Result<(), FwdError> {
    info!("[up] upstream loop started for all servers");
    while !ctx.shutdown.is_requested() {
        forward_cycle(&ctx, &servers, ghost.as_deref_mut())?;
    }
    info!("[up] end of upstream loop");
    Ok(())
}

/// One fetch/filter/serialize/send cycle. Public so the test harness can
/// drive cycles without the outer loop.
pub fn forward_cycle(
    ctx: &Context,
    servers: &[Arc<ServerEndpoint>],
    ghost: Option<&mut (dyn PacketSource + '_)>,
) -> Result<(), FwdError> {
    let batch = fetch_batch(ctx, ghost)?;

    // Dirty read; a stale answer only delays the report by one cycle.
    let send_report = ctx.status.ready_hint();

    if batch.is_empty() && !send_report {
        thread::sleep(Duration::from_millis(FETCH_SLEEP_MS));
        return Ok(());
    }

    // One time-reference snapshot for the whole batch.
    let local_ref = if !batch.is_empty() && ctx.gps_active {
        ctx.timeref.lock().unwrap().snapshot()
    } else {
        None
    };

    // Wall-clock substitute applied to every packet while GPS is inactive.
    let fetch_timestamp = format_utc(Utc::now());

    let token = new_token();
    let mut buffer = PushBuffer::new(token, GatewayId::new(ctx.config.gateway_id));

    for pkt in &batch {
        if !account_and_filter(ctx, pkt) {
            continue;
        }
        let time = if ctx.gps_active {
            local_ref.map(|tref| format_utc(tref.cnt2utc(pkt.count_us)))
        } else {
            Some(fetch_timestamp.clone())
        };
        if let Err(e) = buffer.push_packet(pkt, time.as_deref()) {
            warn!("[up] skipping unserializable packet: {e}");
        }
    }

    let report = if send_report { ctx.status.take() } else { None };
    let Some(dgram) = buffer.finish(report.as_deref()) else {
        // Everything was filtered out and no report is pending.
        return Ok(());
    };

    for server in servers {
        let Some(sock) = server.up() else { continue };
        let send_time = Instant::now();
        if let Err(e) = sock.send(&dgram) {
            warn!("[up] send to server {} failed: {e}", server.address);
        }
        {
            let mut meas = ctx.meas_up.lock().unwrap();
            meas.up_dgram_sent = meas.up_dgram_sent.saturating_add(1);
            meas.up_network_byte = meas.up_network_byte.saturating_add(dgram.len() as u32);
        }
        wait_for_ack(ctx, server, sock, token, send_time);
    }
    Ok(())
}

/// Pulls up to [`NB_PKT_MAX`] packets from the radio, then tops the batch up
/// from the ghost source, all under the concentrator lock.
fn fetch_batch(
    ctx: &Context,
    ghost: Option<&mut (dyn PacketSource + '_)>,
) -> Result<Vec<RxPacket>, FwdError> {
    let mut concentrator = ctx.concentrator.lock().unwrap();
    let mut batch = if ctx.config.radiostream_enabled {
        concentrator.receive(NB_PKT_MAX)?
    } else {
        Vec::new()
    };
    if let Some(ghost) = ghost {
        if batch.len() < NB_PKT_MAX {
            batch.extend(ghost.get(NB_PKT_MAX - batch.len()));
        }
    }
    Ok(batch)
}

/// Counts the packet and decides whether the CRC policy forwards it.
fn account_and_filter(ctx: &Context, pkt: &RxPacket) -> bool {
    let mut meas = ctx.meas_up.lock().unwrap();
    meas.rx_rcv = meas.rx_rcv.saturating_add(1);
    let forward = match pkt.status {
        CrcStatus::CrcOk => {
            meas.rx_ok = meas.rx_ok.saturating_add(1);
            ctx.config.forward_crc_valid
        }
        CrcStatus::CrcBad => {
            meas.rx_bad = meas.rx_bad.saturating_add(1);
            ctx.config.forward_crc_error
        }
        CrcStatus::NoCrc => {
            meas.rx_nocrc = meas.rx_nocrc.saturating_add(1);
            ctx.config.forward_crc_disabled
        }
        CrcStatus::Unknown => {
            warn!(
                "[up] received packet with unknown status (size {}, freq {})",
                pkt.size(),
                pkt.freq_hz
            );
            false
        }
    };
    if forward {
        meas.up_pkt_fwd = meas.up_pkt_fwd.saturating_add(1);
        meas.up_payload_byte = meas.up_payload_byte.saturating_add(pkt.size() as u32);
    }
    forward
}

/// Waits for the PUSH_ACK answering `token`. Two receive slots so an extra
/// queued frame does not mask the acknowledgement; a timeout ends the wait.
fn wait_for_ack(
    ctx: &Context,
    server: &ServerEndpoint,
    sock: &std::net::UdpSocket,
    token: u16,
    send_time: Instant,
) {
    let mut buf = [0u8; 32];
    for _ in 0..2 {
        let len = match sock.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return,
            Err(_) => return,
        };
        match check_ack(&buf[..len], PKT_PUSH_ACK, token) {
            AckOutcome::Match => {
                info!(
                    "[up] PUSH_ACK for server {} received in {} ms",
                    server.address,
                    send_time.elapsed().as_millis()
                );
                let mut meas = ctx.meas_up.lock().unwrap();
                meas.up_ack_rcv = meas.up_ack_rcv.saturating_add(1);
                return;
            }
            // Out-of-sync or foreign frame; the second slot may still
            // carry our acknowledgement.
            AckOutcome::TokenMismatch | AckOutcome::Invalid => continue,
        }
    }
}
