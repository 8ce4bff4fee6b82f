//! # GPS Time Reference
//!
//! This module defines the `Gps` trait through which the sync loop consumes a
//! GPS receiver, and the `TimeReference` tying UTC time to the concentrator's
//! free-running counter. The reference is replaced atomically under its own
//! mutex so readers always observe a consistent (system time, UTC, counter)
//! triple.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::FwdError;

/// A sync whose counter/UTC slope deviates more than this from 1.0 is
/// rejected as implausible and the previous reference is kept.
const XTAL_ERR_MAX_DEV: f64 = 1e-2;

/// Geographic position of the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coord {
    /// Latitude in degrees, north positive.
    pub lat: f64,
    /// Longitude in degrees, east positive.
    pub lon: f64,
    /// Altitude in meters.
    pub alt: i32,
}

/// Kind of NMEA sentence delivered by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmeaKind {
    /// Recommended minimum data; carries date and time, triggers a sync.
    Rmc,
    /// Fix data; carries position and altitude.
    Gga,
    /// Anything else, including unparsable input.
    Other,
}

/// Operations of the GPS receiver consumed by the sync loop.
pub trait Gps: Send {
    /// Blocks until the next NMEA sentence has been read and classified.
    fn read_sentence(&mut self) -> Result<NmeaKind, FwdError>;

    /// UTC time of the last PPS pulse, as derived from the sentence stream.
    fn utc_time(&self) -> Result<DateTime<Utc>, FwdError>;

    /// Last known coordinates of the gateway.
    fn coordinates(&self) -> Result<Coord, FwdError>;
}

/// Relation between UTC time and the concentrator counter, captured on a PPS
/// pulse.
#[derive(Debug, Clone, Copy)]
pub struct TimeReference {
    /// Monotonic instant the reference was established; source of `age`.
    pub sys_time: Instant,
    /// UTC time at the PPS pulse.
    pub utc: DateTime<Utc>,
    /// Counter value captured by hardware on the same pulse.
    pub count_us: u32,
    /// Estimated concentrator ticks per true microsecond.
    pub xtal_err: f64,
}

impl TimeReference {
    /// Builds a new reference from a fresh (counter, UTC) pair.
    ///
    /// With a previous reference available, the crystal error is estimated
    /// from the slope between the two captures; a slope too far from unity
    /// means one of the captures is wrong, and the sync is rejected so the
    /// caller keeps the previous reference.
    pub fn sync(
        prev: Option<&TimeReference>,
        count_us: u32,
        utc: DateTime<Utc>,
    ) -> Result<TimeReference, FwdError> {
        let xtal_err = match prev {
            None => 1.0,
            Some(p) => {
                let utc_diff_us = (utc - p.utc)
                    .num_microseconds()
                    .ok_or_else(|| FwdError::TimeRefError("UTC interval overflow".into()))?;
                if utc_diff_us <= 0 {
                    return Err(FwdError::TimeRefError(
                        "UTC time did not advance since last sync".into(),
                    ));
                }
                let cnt_diff = count_us.wrapping_sub(p.count_us) as f64;
                let slope = cnt_diff / utc_diff_us as f64;
                if (slope - 1.0).abs() > XTAL_ERR_MAX_DEV {
                    return Err(FwdError::TimeRefError(format!(
                        "implausible counter/UTC slope {slope:.9}"
                    )));
                }
                slope
            }
        };
        Ok(TimeReference {
            sys_time: Instant::now(),
            utc,
            count_us,
            xtal_err,
        })
    }

    /// Converts a counter value to UTC absolute time.
    pub fn cnt2utc(&self, count_us: u32) -> DateTime<Utc> {
        let delta_ticks = count_us.wrapping_sub(self.count_us) as i32;
        let delta_us = (delta_ticks as f64 / self.xtal_err).round() as i64;
        self.utc + chrono::Duration::microseconds(delta_us)
    }

    /// Converts a UTC absolute time to the counter value at which it occurs.
    pub fn utc2cnt(&self, utc: DateTime<Utc>) -> Result<u32, FwdError> {
        let delta_us = (utc - self.utc)
            .num_microseconds()
            .ok_or_else(|| FwdError::TimeRefError("UTC interval overflow".into()))?;
        let delta_ticks = (delta_us as f64 * self.xtal_err).round() as i64;
        Ok(self.count_us.wrapping_add(delta_ticks as u32))
    }

    /// Time elapsed since the reference was established.
    pub fn age(&self) -> Duration {
        self.sys_time.elapsed()
    }
}

/// Mutex-guarded slot holding the current time reference and its validity.
///
/// The reference becomes valid on the first successful sync and is
/// invalidated by the validator loop once its age exceeds the admitted
/// maximum; the stale value is kept around so reports can still show its age.
#[derive(Debug, Default)]
pub struct TimeRefSlot {
    pub valid: bool,
    pub tref: Option<TimeReference>,
}

impl TimeRefSlot {
    /// Returns a copy of the reference if it is currently valid.
    pub fn snapshot(&self) -> Option<TimeReference> {
        if self.valid {
            self.tref
        } else {
            None
        }
    }

    /// Installs a fresh reference and marks it valid.
    pub fn install(&mut self, tref: TimeReference) {
        self.tref = Some(tref);
        self.valid = true;
    }
}
