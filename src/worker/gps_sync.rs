//! # GPS Sync Loop
//!
//! Blocks on the GPS sentence stream; every RMC sentence triggers a sync:
//! fetch UTC time, arm or disarm the beacon, capture the trigger counter
//! under the concentrator lock, replace the time reference atomically, and
//! refresh the gateway coordinates.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::hal::gps::{Gps, NmeaKind, TimeReference};
use crate::state::Context;

/// Runs GPS synchronization until shutdown. The loop is detached by the
/// lifecycle (TTY reads can block arbitrarily long); it must not own
/// anything needing cleanup.
pub fn gps_loop(ctx: Arc<Context>, mut gps: Box<dyn Gps>) {
    info!("[gps] sync loop started");
    while !ctx.shutdown.is_requested() {
        match gps.read_sentence() {
            Ok(NmeaKind::Rmc) => handle_rmc(&ctx, gps.as_ref()),
            Ok(_) => {}
            Err(e) => {
                warn!("[gps] {e}");
                // Keeps a dead TTY from turning this loop into a busy spin.
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("[gps] end of sync loop");
}

/// One RMC-triggered synchronization pass.
pub fn handle_rmc(ctx: &Context, gps: &dyn Gps) {
    let utc = match gps.utc_time() {
        Ok(utc) => utc,
        Err(e) => {
            warn!("[gps] could not get UTC time: {e}");
            return;
        }
    };

    // The beacon is armed exactly one second before its slot so that the
    // next PPS pulse triggers it. A period of zero disables beaconing.
    if ctx.config.beacon_enabled && ctx.config.beacon_period > 0 {
        let sec_of_cycle =
            (utc.timestamp() + 1).rem_euclid(ctx.config.beacon_period as i64) as u32;
        ctx.beacon_armed
            .store(sec_of_cycle == ctx.config.beacon_offset, Ordering::Release);
    }

    let trig = match ctx.concentrator.lock().unwrap().trig_cnt() {
        Ok(trig) => trig,
        Err(e) => {
            warn!("[gps] failed to read the trigger counter: {e}");
            return;
        }
    };

    {
        let mut slot = ctx.timeref.lock().unwrap();
        match TimeReference::sync(slot.tref.as_ref(), trig, utc) {
            Ok(tref) => slot.install(tref),
            Err(e) => {
                warn!("[gps] out of sync, keeping previous time reference ({e})");
                return;
            }
        }
    }

    let coord = gps.coordinates();
    let mut meas = ctx.meas_gps.lock().unwrap();
    match coord {
        Ok(coord) => {
            meas.coord_valid = true;
            meas.coord = coord;
        }
        Err(_) => meas.coord_valid = false,
    }
}
