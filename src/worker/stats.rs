//! # Statistics Reporter
//!
//! Runs on the main thread. Every statistics interval: snapshot-and-reset
//! both measurement groups, print the human report, render the JSON status
//! fragment consumed by the upstream loop, and check the trigger counter for
//! the silent-reset sentinel, which is fatal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};

use crate::constants::{STATUS_SIZE, TRIGCNT_RESET_SENTINEL};
use crate::error::FwdError;
use crate::hal::gps::Coord;
use crate::state::{Context, DownstreamCounters, UpstreamCounters};

/// Runs the reporter until shutdown. The silent-reset sentinel is the one
/// fatal condition, surfaced as an error.
pub fn stats_loop(ctx: Arc<Context>) -> Result<(), FwdError> {
    let interval = Duration::from_secs(ctx.config.stat_interval_s);
    while !ctx.shutdown.is_requested() {
        ctx.shutdown.interruptible_sleep(interval);
        if ctx.shutdown.is_requested() {
            break;
        }
        report_once(&ctx)?;
    }
    Ok(())
}

/// One reporting pass.
pub fn report_once(ctx: &Context) -> Result<(), FwdError> {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S %Z").to_string();

    let up = ctx.meas_up.lock().unwrap().take();
    let dw = ctx.meas_dw.lock().unwrap().take();

    let percent = |part: u32, whole: u32| {
        if whole > 0 {
            100.0 * f64::from(part) / f64::from(whole)
        } else {
            0.0
        }
    };
    let up_ack_percent = percent(up.up_ack_rcv, up.up_dgram_sent);

    // Live coordinates, overridden by the reference position when faked.
    let (coord_ok, coord) = if ctx.config.fake_gps {
        (true, ctx.config.reference_coord)
    } else if ctx.gps_active {
        let meas = ctx.meas_gps.lock().unwrap();
        (meas.coord_valid, meas.coord)
    } else {
        (false, Coord::default())
    };

    info!("##### {timestamp} #####");
    info!("# RF packets received by concentrator: {}", up.rx_rcv);
    info!(
        "# CRC_OK: {:.2}%, CRC_FAIL: {:.2}%, NO_CRC: {:.2}%",
        percent(up.rx_ok, up.rx_rcv),
        percent(up.rx_bad, up.rx_rcv),
        percent(up.rx_nocrc, up.rx_rcv)
    );
    info!(
        "# RF packets forwarded: {} ({} bytes)",
        up.up_pkt_fwd, up.up_payload_byte
    );
    info!(
        "# PUSH_DATA datagrams sent: {} ({} bytes)",
        up.up_dgram_sent, up.up_network_byte
    );
    info!("# PUSH_DATA acknowledged: {up_ack_percent:.2}%");
    info!("### [DOWNSTREAM] ###");
    info!(
        "# PULL_DATA sent: {} ({:.2}% acknowledged)",
        dw.dw_pull_sent,
        percent(dw.dw_ack_rcv, dw.dw_pull_sent)
    );
    info!(
        "# PULL_RESP datagrams received: {} ({} bytes)",
        dw.dw_dgram_rcv, dw.dw_network_byte
    );
    info!(
        "# RF packets sent to concentrator: {} ({} bytes)",
        dw.nb_tx_ok.saturating_add(dw.nb_tx_fail),
        dw.dw_payload_byte
    );
    info!("# TX errors: {}", dw.nb_tx_fail);
    info!("### [GPS] ###");
    if ctx.config.gps_enabled {
        // Display only; validity is the validator's business.
        let slot = ctx.timeref.lock().unwrap();
        match (&slot.tref, slot.valid) {
            (Some(tref), true) => {
                info!("# Valid gps time reference (age: {} sec)", tref.age().as_secs())
            }
            (Some(tref), false) => {
                info!("# Invalid gps time reference (age: {} sec)", tref.age().as_secs())
            }
            (None, _) => info!("# Invalid gps time reference (never synchronized)"),
        }
        drop(slot);
        if ctx.config.fake_gps {
            info!(
                "# Manual GPS coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
                coord.lat, coord.lon, coord.alt
            );
        } else if coord_ok {
            info!(
                "# System GPS coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
                coord.lat, coord.lon, coord.alt
            );
        } else {
            info!("# no valid GPS coordinates available yet");
        }
    } else {
        info!("# GPS sync is disabled");
    }
    info!("##### END #####");

    if ctx.config.statusstream_enabled {
        let gps_coord = (ctx.config.gps_enabled && coord_ok).then_some(coord);
        let fragment = render_status(&timestamp, gps_coord, &up, up_ack_percent, &dw, ctx);
        ctx.status.publish(fragment);
    }

    // A trigger counter stuck at the sentinel means the chip silently
    // reset; a read failure (e.g. radio disabled) is not significant here.
    if let Ok(trig) = ctx.concentrator.lock().unwrap().trig_cnt() {
        if trig == TRIGCNT_RESET_SENTINEL {
            return Err(FwdError::HalError(
                "unintended concentrator reset detected".into(),
            ));
        }
    }
    Ok(())
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Renders the `"stat":{…}` fragment. With valid coordinates the location
/// fields are included; otherwise the abbreviated form is used. The result
/// always fits the status buffer: the description shrinks first if it does
/// not.
fn render_status(
    timestamp: &str,
    gps_coord: Option<Coord>,
    up: &UpstreamCounters,
    up_ack_percent: f64,
    dw: &DownstreamCounters,
    ctx: &Context,
) -> String {
    let render = |desc: &str| {
        let mut out = String::with_capacity(STATUS_SIZE);
        out.push_str("\"stat\":{");
        out.push_str(&format!("\"time\":\"{timestamp}\""));
        if let Some(coord) = gps_coord {
            out.push_str(&format!(
                ",\"lati\":{:.5},\"long\":{:.5},\"alti\":{}",
                coord.lat, coord.lon, coord.alt
            ));
        }
        out.push_str(&format!(
            ",\"rxnb\":{},\"rxok\":{},\"rxfw\":{},\"ackr\":{:.1},\"dwnb\":{},\"txnb\":{}",
            up.rx_rcv, up.rx_ok, up.up_pkt_fwd, up_ack_percent, dw.dw_dgram_rcv, dw.nb_tx_ok
        ));
        out.push_str(&format!(
            ",\"pfrm\":\"{}\",\"mail\":\"{}\",\"desc\":\"{}\"}}",
            json_escape(&ctx.config.platform),
            json_escape(&ctx.config.contact_email),
            desc
        ));
        out
    };

    let mut fragment = render(&json_escape(&ctx.config.description));
    if fragment.len() > STATUS_SIZE - 1 {
        warn!("status report does not fit its buffer, dropping the description");
        fragment = render("");
    }
    fragment
}
