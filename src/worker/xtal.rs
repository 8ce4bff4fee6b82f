//! # Validator Loop
//!
//! Once per second: invalidates the GPS time reference once it is older than
//! the admitted maximum, and maintains the crystal-oscillator correction
//! factor: an initial average over the first raw error samples, then
//! low-pass tracking. Losing the reference resets the correction to 1.0.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::constants::{GPS_REF_MAX_AGE_S, XERR_FILT_COEF, XERR_INIT_AVG};
use crate::state::Context;

/// Oscillator-correction estimator state, local to the validator thread.
#[derive(Debug, Default)]
pub struct XtalTracker {
    init_cnt: u32,
    init_acc: f64,
}

impl XtalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// One validation pass: age-check the reference, then feed its error
    /// sample into the correction estimator.
    pub fn update(&mut self, ctx: &Context) {
        let sample = {
            let mut slot = ctx.timeref.lock().unwrap();
            match slot.tref {
                Some(tref) if tref.age() <= Duration::from_secs(GPS_REF_MAX_AGE_S) => {
                    slot.valid = true;
                    Some(tref.xtal_err)
                }
                _ => {
                    slot.valid = false;
                    None
                }
            }
        };

        let Some(xtal_err) = sample else {
            // No usable sync; drop the correction back to neutral and start
            // the averaging over.
            ctx.xtal.lock().unwrap().reset();
            self.init_cnt = 0;
            self.init_acc = 0.0;
            return;
        };

        if self.init_cnt < XERR_INIT_AVG {
            self.init_acc += xtal_err;
            self.init_cnt += 1;
        } else if self.init_cnt == XERR_INIT_AVG {
            let mut xtal = ctx.xtal.lock().unwrap();
            xtal.value = f64::from(XERR_INIT_AVG) / self.init_acc;
            xtal.valid = true;
            self.init_cnt += 1;
        } else {
            let sample_correct = 1.0 / xtal_err;
            let mut xtal = ctx.xtal.lock().unwrap();
            xtal.value = xtal.value - xtal.value / XERR_FILT_COEF + sample_correct / XERR_FILT_COEF;
        }
    }
}

/// Runs validation until shutdown.
pub fn validator_loop(ctx: Arc<Context>) {
    info!("[valid] validation loop started");
    let mut tracker = XtalTracker::new();
    while !ctx.shutdown.is_requested() {
        ctx.shutdown.interruptible_sleep(Duration::from_secs(1));
        if ctx.shutdown.is_requested() {
            break;
        }
        tracker.update(&ctx);
    }
    info!("[valid] end of validation loop");
}
