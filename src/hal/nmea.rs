//! # NMEA Front-End
//!
//! A minimal, checksum-verified reader for the two sentence kinds the sync
//! loop dispatches on: RMC (date/time) and GGA (position/altitude). Anything
//! else is classified as `Other` and ignored upstream. The serial port is
//! expected to be configured (line discipline, baud rate) before the daemon
//! starts.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use log::debug;

use crate::error::FwdError;
use crate::hal::gps::{Coord, Gps, NmeaKind};

/// Verifies the `*hh` checksum of a full NMEA sentence.
pub fn checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    let Some((payload, given)) = body.rsplit_once('*') else {
        return false;
    };
    let Ok(given) = u8::from_str_radix(given.trim(), 16) else {
        return false;
    };
    let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    computed == given
}

/// Degrees from the NMEA `(d)ddmm.mmmm` angle encoding.
fn parse_angle(field: &str, hemisphere: &str, negative_on: char) -> Option<f64> {
    let dot = field.find('.')?;
    if dot < 3 {
        return None;
    }
    let (deg_part, min_part) = field.split_at(dot - 2);
    let degrees: f64 = deg_part.parse().ok()?;
    let minutes: f64 = min_part.parse().ok()?;
    let mut value = degrees + minutes / 60.0;
    if hemisphere.starts_with(negative_on) {
        value = -value;
    }
    Some(value)
}

fn parse_hms(field: &str) -> Option<NaiveTime> {
    if field.len() < 6 {
        return None;
    }
    let h: u32 = field[0..2].parse().ok()?;
    let m: u32 = field[2..4].parse().ok()?;
    // Fractional seconds are dropped: the reference second is the PPS mark.
    let s: u32 = field[4..6].parse().ok()?;
    NaiveTime::from_hms_opt(h, m, s)
}

fn parse_dmy(field: &str) -> Option<NaiveDate> {
    if field.len() != 6 {
        return None;
    }
    let d: u32 = field[0..2].parse().ok()?;
    let m: u32 = field[2..4].parse().ok()?;
    let y: i32 = field[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + y, m, d)
}

/// GPS receiver reading NMEA sentences from a serial TTY.
pub struct TtyGps {
    reader: BufReader<File>,
    last_utc: Option<DateTime<Utc>>,
    last_coord: Option<Coord>,
    /// Altitude arrives in GGA while the fix position is refreshed by both
    /// sentence kinds; remember the last one seen.
    last_alt: i32,
}

impl TtyGps {
    /// Opens the GPS TTY for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FwdError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            FwdError::GpsError(format!("cannot open {}: {e}", path.as_ref().display()))
        })?;
        Ok(TtyGps {
            reader: BufReader::new(file),
            last_utc: None,
            last_coord: None,
            last_alt: 0,
        })
    }

    fn handle_rmc(&mut self, fields: &[&str]) {
        // $GxRMC,time,status,lat,N/S,lon,E/W,speed,course,date,...
        if fields.len() < 10 || fields[2] != "A" {
            return;
        }
        if let (Some(time), Some(date)) = (parse_hms(fields[1]), parse_dmy(fields[9])) {
            self.last_utc = Some(Utc.from_utc_datetime(&date.and_time(time)));
        }
        if let (Some(lat), Some(lon)) = (
            parse_angle(fields[3], fields[4], 'S'),
            parse_angle(fields[5], fields[6], 'W'),
        ) {
            self.last_coord = Some(Coord {
                lat,
                lon,
                alt: self.last_alt,
            });
        }
    }

    fn handle_gga(&mut self, fields: &[&str]) {
        // $GxGGA,time,lat,N/S,lon,E/W,quality,sats,hdop,alt,M,...
        if fields.len() < 10 || fields[6] == "0" {
            return;
        }
        if let Ok(alt) = fields[9].parse::<f64>() {
            self.last_alt = alt.round() as i32;
        }
        if let (Some(lat), Some(lon)) = (
            parse_angle(fields[2], fields[3], 'S'),
            parse_angle(fields[4], fields[5], 'W'),
        ) {
            self.last_coord = Some(Coord {
                lat,
                lon,
                alt: self.last_alt,
            });
        }
    }

    /// Classifies one sentence and folds its content into the receiver state.
    fn process(&mut self, line: &str) -> NmeaKind {
        let sentence = line.trim_end();
        if sentence.is_empty() || !sentence.is_ascii() || !checksum_ok(sentence) {
            return NmeaKind::Other;
        }
        let payload = &sentence[1..sentence.rfind('*').unwrap_or(sentence.len())];
        let fields: Vec<&str> = payload.split(',').collect();
        if fields[0].len() != 5 {
            return NmeaKind::Other;
        }
        match &fields[0][2..] {
            "RMC" => {
                self.handle_rmc(&fields);
                NmeaKind::Rmc
            }
            "GGA" => {
                self.handle_gga(&fields);
                NmeaKind::Gga
            }
            other => {
                debug!("[gps] ignoring NMEA sentence kind {other}");
                NmeaKind::Other
            }
        }
    }
}

impl Gps for TtyGps {
    fn read_sentence(&mut self) -> Result<NmeaKind, FwdError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| FwdError::GpsError(format!("TTY read failed: {e}")))?;
        if n == 0 {
            return Err(FwdError::GpsError("TTY closed".into()));
        }
        Ok(self.process(&line))
    }

    fn utc_time(&self) -> Result<DateTime<Utc>, FwdError> {
        self.last_utc
            .ok_or_else(|| FwdError::GpsError("no UTC time received yet".into()))
    }

    fn coordinates(&self) -> Result<Coord, FwdError> {
        self.last_coord
            .ok_or_else(|| FwdError::GpsError("no position fix yet".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RMC: &str =
        "$GPRMC,102215.00,A,4851.480,N,00217.700,E,0.04,77.52,170423,,,A*6E";
    const GGA: &str =
        "$GPGGA,102216.00,4851.480,N,00217.700,E,1,08,0.9,35.0,M,45.5,M,,*4F";

    fn checksummed(body: &str) -> String {
        let cs = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${body}*{cs:02X}")
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let good = checksummed("GPRMC,102215.00,A,4851.480,N,00217.700,E,0.04,77.52,170423,,,A");
        assert!(checksum_ok(&good));
        let bad = good.replace("4851", "4852");
        assert!(!checksum_ok(&bad));
    }

    #[test]
    fn test_rmc_updates_time_and_position() {
        let mut gps = TtyGps {
            reader: BufReader::new(File::open("/dev/null").unwrap()),
            last_utc: None,
            last_coord: None,
            last_alt: 0,
        };
        let sentence = checksummed(&RMC[1..RMC.rfind('*').unwrap()]);
        assert_eq!(gps.process(&sentence), NmeaKind::Rmc);
        let utc = gps.utc_time().unwrap();
        assert_eq!(utc.to_rfc3339(), "2023-04-17T10:22:15+00:00");
        let coord = gps.coordinates().unwrap();
        assert!((coord.lat - 48.858).abs() < 1e-3);
        assert!((coord.lon - 2.295).abs() < 1e-3);
    }

    #[test]
    fn test_gga_updates_altitude() {
        let mut gps = TtyGps {
            reader: BufReader::new(File::open("/dev/null").unwrap()),
            last_utc: None,
            last_coord: None,
            last_alt: 0,
        };
        let sentence = checksummed(&GGA[1..GGA.rfind('*').unwrap()]);
        assert_eq!(gps.process(&sentence), NmeaKind::Gga);
        assert_eq!(gps.coordinates().unwrap().alt, 35);
    }

    #[test]
    fn test_rmc_without_fix_keeps_state() {
        let mut gps = TtyGps {
            reader: BufReader::new(File::open("/dev/null").unwrap()),
            last_utc: None,
            last_coord: None,
            last_alt: 0,
        };
        let sentence =
            checksummed("GPRMC,102215.00,V,,,,,,,170423,,,N");
        assert_eq!(gps.process(&sentence), NmeaKind::Rmc);
        assert!(gps.utc_time().is_err());
    }
}
