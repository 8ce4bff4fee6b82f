//! # Downstream Loop
//!
//! One independent loop per live server: announces downlink availability
//! with PULL_DATA keep-alives, tracks their acknowledgements (driving the
//! auto-quit watchdog), and turns PULL_RESP requests into radio
//! transmissions. The beacon emit path lives here too, because it needs the
//! concentrator lock between two receive slots.

use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::beacon::beacon_packet;
use crate::constants::{BEACON_POLL_MS, BEACON_POLL_TOTAL_MS, PKT_PULL_DATA};
use crate::error::FwdError;
use crate::hal::{TxMode, TxStatus};
use crate::state::Context;
use crate::transport::ServerEndpoint;
use crate::wire::txpk::{parse_pull_resp, TxTiming};
use crate::wire::{classify_downstream, new_token, request_header, Downstream, GatewayId};

/// Polls one server for downlink traffic until shutdown.
pub fn downstream_loop(ctx: Arc<Context>, server: Arc<ServerEndpoint>) -> Result<(), FwdError> {
    let Some(sock) = server.down() else {
        // Non-live servers never get a downstream thread; belt and braces.
        return Ok(());
    };
    info!("[down] downstream loop started for server {}", server.address);

    let gateway = GatewayId::new(ctx.config.gateway_id);
    let keepalive = Duration::from_secs(ctx.config.keepalive_s);
    let autoquit_threshold = ctx.config.autoquit_threshold;
    let mut autoquit_cnt: u32 = 0;

    while !ctx.shutdown.is_requested() {
        if autoquit_threshold > 0 && autoquit_cnt >= autoquit_threshold {
            info!(
                "[down] the last {autoquit_threshold} PULL_DATA to server {} were not \
                 acknowledged, shutting down",
                server.address
            );
            ctx.shutdown.request_exit();
            break;
        }

        let token = new_token();
        if let Err(e) = sock.send(&request_header(PKT_PULL_DATA, token, gateway)) {
            warn!("[down] PULL_DATA send to {} failed: {e}", server.address);
        }
        let send_time = Instant::now();
        {
            let mut meas = ctx.meas_dw.lock().unwrap();
            meas.dw_pull_sent = meas.dw_pull_sent.saturating_add(1);
        }
        let mut req_ack = false;
        autoquit_cnt = autoquit_cnt.saturating_add(1);

        // Listen until the next keep-alive is due; each receive is bounded
        // by the downstream socket timeout.
        while send_time.elapsed() < keepalive && !ctx.shutdown.is_requested() {
            let mut buf = [0u8; 1024];
            let received = match sock.recv(&mut buf) {
                Ok(len) => Some(len),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
                Err(e) => {
                    debug!("[down] recv from {} failed: {e}", server.address);
                    None
                }
            };

            maybe_emit_beacon(&ctx);

            let Some(len) = received else { continue };
            match classify_downstream(&buf[..len]) {
                None => continue,
                Some(Downstream::PullAck { token: acked }) => {
                    if acked != token {
                        info!("[down] out-of-sync PULL_ACK from server {}", server.address);
                    } else if req_ack {
                        info!("[down] duplicate PULL_ACK from server {}", server.address);
                    } else {
                        req_ack = true;
                        autoquit_cnt = 0;
                        let mut meas = ctx.meas_dw.lock().unwrap();
                        meas.dw_ack_rcv = meas.dw_ack_rcv.saturating_add(1);
                        drop(meas);
                        info!(
                            "[down] PULL_ACK from server {} received in {} ms",
                            server.address,
                            send_time.elapsed().as_millis()
                        );
                    }
                }
                Some(Downstream::PullResp { body }) => {
                    debug!("[down] PULL_RESP received from server {}", server.address);
                    handle_pull_resp(&ctx, &server.address, body, len);
                }
            }
        }
    }
    info!("[down] end of downstream loop for server {}", server.address);
    Ok(())
}

/// Decodes one PULL_RESP body and hands the frame to the radio. Every
/// failure warns and abandons this frame only.
pub fn handle_pull_resp(ctx: &Context, server: &str, body: &[u8], dgram_len: usize) {
    let txpk = match parse_pull_resp(body) {
        Ok(txpk) => txpk,
        Err(e) => {
            warn!("[down] from server {server}: {e}, TX aborted");
            return;
        }
    };

    let (tx_mode, count_us) = match txpk.timing() {
        Ok(TxTiming::Immediate) => {
            debug!("[down] a packet will be sent in immediate mode");
            (TxMode::Immediate, 0)
        }
        Ok(TxTiming::Counter(count_us)) => (TxMode::Timestamped, count_us),
        Ok(TxTiming::Utc(utc)) => {
            if !ctx.gps_active {
                warn!("[down] GPS disabled, impossible to send on a UTC time, TX aborted");
                return;
            }
            let Some(tref) = ctx.timeref.lock().unwrap().snapshot() else {
                warn!("[down] no valid GPS time reference yet, TX aborted");
                return;
            };
            match tref.utc2cnt(utc) {
                Ok(count_us) => {
                    debug!("[down] a packet will be sent on counter value {count_us} (from UTC)");
                    (TxMode::Timestamped, count_us)
                }
                Err(e) => {
                    warn!("[down] could not convert UTC time to a counter value: {e}, TX aborted");
                    return;
                }
            }
        }
        Err(e) => {
            warn!("[down] from server {server}: {e}, TX aborted");
            return;
        }
    };

    let pkt = match txpk.to_tx_packet(tx_mode, count_us) {
        Ok(pkt) => pkt,
        Err(e) => {
            warn!("[down] from server {server}: {e}, TX aborted");
            return;
        }
    };

    {
        let mut meas = ctx.meas_dw.lock().unwrap();
        meas.dw_dgram_rcv = meas.dw_dgram_rcv.saturating_add(1);
        meas.dw_network_byte = meas.dw_network_byte.saturating_add(dgram_len as u32);
        meas.dw_payload_byte = meas.dw_payload_byte.saturating_add(pkt.size() as u32);
    }

    let sent = ctx.concentrator.lock().unwrap().send(&pkt);
    let mut meas = ctx.meas_dw.lock().unwrap();
    match sent {
        Ok(()) => meas.nb_tx_ok = meas.nb_tx_ok.saturating_add(1),
        Err(e) => {
            meas.nb_tx_fail = meas.nb_tx_fail.saturating_add(1);
            drop(meas);
            warn!("[down] concentrator rejected the frame: {e}");
        }
    }
}

/// If the GPS loop armed a beacon, builds and emits it, then polls the TX
/// path until the frame left. The armed flag is cleared whether the beacon
/// is emitted or skipped.
pub fn maybe_emit_beacon(ctx: &Context) {
    if !ctx.gps_active || !ctx.beacon_armed.swap(false, Ordering::AcqRel) {
        return;
    }

    let Some(tref) = ctx.timeref.lock().unwrap().snapshot() else {
        return;
    };
    let xtal = *ctx.xtal.lock().unwrap();
    if !xtal.valid {
        return;
    }

    let pkt = beacon_packet(
        tref.utc,
        ctx.config.reference_coord,
        xtal.value,
        ctx.config.beacon_freq_hz,
    );
    info!("[down] beacon ready to send (frequency {} Hz)", pkt.freq_hz);

    if let Err(e) = ctx.concentrator.lock().unwrap().send(&pkt) {
        warn!("[down] failed to send beacon packet: {e}");
        return;
    }

    let mut status = TxStatus::Unknown;
    for _ in 0..(BEACON_POLL_TOTAL_MS / BEACON_POLL_MS) {
        thread::sleep(Duration::from_millis(BEACON_POLL_MS));
        status = ctx
            .concentrator
            .lock()
            .unwrap()
            .tx_status()
            .unwrap_or(TxStatus::Unknown);
        if status == TxStatus::Free {
            break;
        }
    }
    if status == TxStatus::Free {
        info!("[down] beacon sent successfully");
    } else {
        warn!("[down] beacon was scheduled but failed to TX");
    }
}
