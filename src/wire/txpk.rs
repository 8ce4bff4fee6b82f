//! # Downstream Datagram Decoding
//!
//! Decodes the JSON body of a PULL_RESP into a [`TxPk`] request and converts
//! it into a HAL [`TxPacket`]. Any missing mandatory field, unknown
//! identifier or malformed value abandons the frame; no error is reported
//! back to the server.

use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::warn;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::constants::{
    MIN_FSK_PREAMBLE, MIN_LORA_PREAMBLE, STD_FSK_PREAMBLE, STD_LORA_PREAMBLE,
};
use crate::error::FwdError;
use crate::hal::{Bandwidth, CodeRate, DataRate, Modulation, SpreadingFactor, TxMode, TxPacket};
use crate::util::strip_json_comments;

/// How the server wants the frame timed, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTiming {
    /// `"imme":true`, as soon as possible.
    Immediate,
    /// `"tmst":<u32>`, at the given concentrator counter value.
    Counter(u32),
    /// `"time":<ISO 8601>`, at the given UTC time, to be converted through
    /// the GPS time reference.
    Utc(DateTime<Utc>),
}

/// The `datr` field is a string for LoRa and a number for FSK.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Datr {
    Lora(String),
    Fsk(u32),
}

impl<'de> Deserialize<'de> for Datr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Datr::Lora(s)),
            Value::Number(n) => n
                .as_u64()
                .filter(|v| *v <= u32::MAX as u64)
                .map(|v| Datr::Fsk(v as u32))
                .ok_or_else(|| D::Error::custom("datr out of range")),
            _ => Err(D::Error::custom("datr must be a string or a number")),
        }
    }
}

impl<'de> Deserialize<'de> for Modulation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.as_str() {
            "LORA" => Ok(Modulation::Lora),
            "FSK" => Ok(Modulation::Fsk),
            other => Err(D::Error::custom(format!("invalid modulation \"{other}\""))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PullRespBody {
    txpk: TxPk,
}

/// One transmission request, as carried in a PULL_RESP body.
#[derive(Debug, Deserialize)]
pub struct TxPk {
    imme: Option<bool>,
    tmst: Option<u32>,
    time: Option<String>,
    /// TX center frequency, in MHz.
    freq: f64,
    rfch: u8,
    powe: Option<i8>,
    modu: Modulation,
    datr: Datr,
    codr: Option<String>,
    /// FSK frequency deviation, in Hz.
    fdev: Option<u32>,
    ipol: Option<bool>,
    prea: Option<u16>,
    size: u16,
    data: String,
    ncrc: Option<bool>,
}

/// Decodes a PULL_RESP body (the bytes after the 4-byte header) into a
/// transmission request. Comments are tolerated.
pub fn parse_pull_resp(body: &[u8]) -> Result<TxPk, FwdError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| FwdError::DownlinkError("body is not UTF-8".into()))?;
    let parsed: PullRespBody = serde_json::from_str(&strip_json_comments(text))
        .map_err(|e| FwdError::DownlinkError(format!("invalid JSON: {e}")))?;
    Ok(parsed.txpk)
}

fn parse_lora_datr(s: &str) -> Result<(SpreadingFactor, Bandwidth), FwdError> {
    let rest = s
        .strip_prefix("SF")
        .ok_or_else(|| FwdError::DownlinkError(format!("format error in datr \"{s}\"")))?;
    let (sf_str, bw_str) = rest
        .split_once("BW")
        .ok_or_else(|| FwdError::DownlinkError(format!("format error in datr \"{s}\"")))?;
    let sf = sf_str
        .parse::<u8>()
        .ok()
        .and_then(SpreadingFactor::from_number)
        .ok_or_else(|| FwdError::DownlinkError(format!("invalid SF in datr \"{s}\"")))?;
    let bw = bw_str
        .parse::<u32>()
        .ok()
        .and_then(Bandwidth::from_khz)
        .ok_or_else(|| FwdError::DownlinkError(format!("invalid BW in datr \"{s}\"")))?;
    Ok((sf, bw))
}

fn parse_codr(s: &str) -> Result<CodeRate, FwdError> {
    match s {
        "4/5" => Ok(CodeRate::Cr4_5),
        "4/6" | "2/3" => Ok(CodeRate::Cr4_6),
        "4/7" => Ok(CodeRate::Cr4_7),
        "4/8" | "1/2" => Ok(CodeRate::Cr4_8),
        other => Err(FwdError::DownlinkError(format!(
            "format error in codr \"{other}\""
        ))),
    }
}

/// Base64 with optional padding, as the protocol allows.
fn decode_data(data: &str) -> Result<Vec<u8>, FwdError> {
    BASE64
        .decode(data)
        .or_else(|_| BASE64_NO_PAD.decode(data))
        .map_err(FwdError::Base64Error)
}

impl TxPk {
    /// The requested timing mode. Exactly one must be present; `imme` wins
    /// over `tmst`, which wins over `time`.
    pub fn timing(&self) -> Result<TxTiming, FwdError> {
        if self.imme == Some(true) {
            return Ok(TxTiming::Immediate);
        }
        if let Some(count_us) = self.tmst {
            return Ok(TxTiming::Counter(count_us));
        }
        if let Some(time) = &self.time {
            let naive = NaiveDateTime::parse_from_str(
                time.trim_end_matches('Z'),
                "%Y-%m-%dT%H:%M:%S%.f",
            )
            .map_err(|_| {
                FwdError::DownlinkError(format!("time \"{time}\" does not follow ISO 8601"))
            })?;
            return Ok(TxTiming::Utc(Utc.from_utc_datetime(&naive)));
        }
        Err(FwdError::DownlinkError(
            "no mandatory imme, tmst or time field".into(),
        ))
    }

    /// Validates the request and builds the HAL frame. Timing must already
    /// be resolved to a mode and counter value.
    pub fn to_tx_packet(&self, tx_mode: TxMode, count_us: u32) -> Result<TxPacket, FwdError> {
        let freq_hz = (self.freq * 1e6).round() as u32;
        let payload = decode_data(&self.data)?;
        if payload.len() != self.size as usize {
            warn!(
                "[down] size field {} does not match data length {}",
                self.size,
                payload.len()
            );
        }

        let (datarate, bandwidth, coderate, preamble, f_dev_khz) = match self.modu {
            Modulation::Lora => {
                let Datr::Lora(datr) = &self.datr else {
                    return Err(FwdError::DownlinkError(
                        "LoRa downlink carries a numeric datr".into(),
                    ));
                };
                let (sf, bw) = parse_lora_datr(datr)?;
                let codr = self
                    .codr
                    .as_deref()
                    .ok_or_else(|| FwdError::DownlinkError("no mandatory codr field".into()))?;
                let coderate = parse_codr(codr)?;
                let preamble = self
                    .prea
                    .map(|p| p.max(MIN_LORA_PREAMBLE))
                    .unwrap_or(STD_LORA_PREAMBLE);
                (DataRate::Lora(sf), bw, coderate, preamble, 0)
            }
            Modulation::Fsk => {
                let Datr::Fsk(bps) = &self.datr else {
                    return Err(FwdError::DownlinkError(
                        "FSK downlink carries a string datr".into(),
                    ));
                };
                let bps = *bps;
                let fdev_hz = self
                    .fdev
                    .ok_or_else(|| FwdError::DownlinkError("no mandatory fdev field".into()))?;
                let preamble = self
                    .prea
                    .map(|p| p.max(MIN_FSK_PREAMBLE))
                    .unwrap_or(STD_FSK_PREAMBLE);
                // The HAL wants the deviation in kHz; bandwidth does not
                // apply to FSK transmissions.
                (
                    DataRate::Fsk(bps),
                    Bandwidth::Khz125,
                    CodeRate::Off,
                    preamble,
                    (fdev_hz / 1000) as u8,
                )
            }
        };

        Ok(TxPacket {
            tx_mode,
            count_us,
            freq_hz,
            rf_chain: self.rfch,
            rf_power: self.powe.unwrap_or(0),
            datarate,
            bandwidth,
            coderate,
            invert_pol: self.ipol.unwrap_or(false),
            preamble,
            no_crc: self.ncrc.unwrap_or(false),
            no_header: false,
            f_dev_khz,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> TxPk {
        parse_pull_resp(json.as_bytes()).unwrap()
    }

    const LORA_IMMEDIATE: &str = r#"{"txpk":{"imme":true,"freq":869.525,"rfch":0,"powe":14,
        "modu":"LORA","datr":"SF9BW125","codr":"4/5","size":5,"data":"aGVsbG8="}}"#;

    #[test]
    fn test_immediate_lora_request() {
        let txpk = parse(LORA_IMMEDIATE);
        assert_eq!(txpk.timing().unwrap(), TxTiming::Immediate);
        let pkt = txpk.to_tx_packet(TxMode::Immediate, 0).unwrap();
        assert_eq!(pkt.tx_mode, TxMode::Immediate);
        assert_eq!(pkt.freq_hz, 869_525_000);
        assert_eq!(pkt.rf_power, 14);
        assert_eq!(pkt.datarate, DataRate::Lora(SpreadingFactor::Sf9));
        assert_eq!(pkt.bandwidth, Bandwidth::Khz125);
        assert_eq!(pkt.coderate, CodeRate::Cr4_5);
        assert_eq!(pkt.preamble, STD_LORA_PREAMBLE);
        assert_eq!(pkt.payload, b"hello");
    }

    #[test]
    fn test_timing_priority_imme_over_tmst_over_time() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"tmst":42,"time":"2023-04-17T10:22:15Z","freq":868.1,
                "rfch":0,"modu":"LORA","datr":"SF7BW125","codr":"4/5","size":1,"data":"AA=="}}"#,
        );
        assert_eq!(txpk.timing().unwrap(), TxTiming::Immediate);

        let txpk = parse(
            r#"{"txpk":{"tmst":42,"time":"2023-04-17T10:22:15Z","freq":868.1,"rfch":0,
                "modu":"LORA","datr":"SF7BW125","codr":"4/5","size":1,"data":"AA=="}}"#,
        );
        assert_eq!(txpk.timing().unwrap(), TxTiming::Counter(42));

        let txpk = parse(
            r#"{"txpk":{"time":"2023-04-17T10:22:15.5Z","freq":868.1,"rfch":0,
                "modu":"LORA","datr":"SF7BW125","codr":"4/5","size":1,"data":"AA=="}}"#,
        );
        match txpk.timing().unwrap() {
            TxTiming::Utc(utc) => {
                assert_eq!(utc.to_rfc3339(), "2023-04-17T10:22:15.500+00:00")
            }
            other => panic!("expected UTC timing, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_timing_is_an_error() {
        let txpk = parse(
            r#"{"txpk":{"freq":868.1,"rfch":0,"modu":"LORA","datr":"SF7BW125",
                "codr":"4/5","size":1,"data":"AA=="}}"#,
        );
        assert!(txpk.timing().is_err());
    }

    #[test]
    fn test_coderate_aliases() {
        assert_eq!(parse_codr("2/3").unwrap(), CodeRate::Cr4_6);
        assert_eq!(parse_codr("1/2").unwrap(), CodeRate::Cr4_8);
        assert!(parse_codr("3/4").is_err());
    }

    #[test]
    fn test_lora_datr_validation() {
        assert!(parse_lora_datr("SF7BW125").is_ok());
        assert!(parse_lora_datr("SF6BW125").is_err());
        assert!(parse_lora_datr("SF7BW333").is_err());
        assert!(parse_lora_datr("7BW125").is_err());
    }

    #[test]
    fn test_lora_preamble_clamped_to_minimum() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"freq":868.1,"rfch":0,"modu":"LORA","datr":"SF7BW125",
                "codr":"4/5","prea":2,"size":1,"data":"AA=="}}"#,
        );
        let pkt = txpk.to_tx_packet(TxMode::Immediate, 0).unwrap();
        assert_eq!(pkt.preamble, MIN_LORA_PREAMBLE);
    }

    #[test]
    fn test_fsk_request() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"freq":868.8,"rfch":0,"modu":"FSK","datr":50000,
                "fdev":25000,"prea":5,"size":3,"data":"AQID"}}"#,
        );
        let pkt = txpk.to_tx_packet(TxMode::Immediate, 0).unwrap();
        assert_eq!(pkt.datarate, DataRate::Fsk(50_000));
        assert_eq!(pkt.f_dev_khz, 25);
        assert_eq!(pkt.preamble, 5);
        assert_eq!(pkt.payload, &[1, 2, 3]);
    }

    #[test]
    fn test_fsk_requires_fdev() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"freq":868.8,"rfch":0,"modu":"FSK","datr":50000,
                "size":1,"data":"AA=="}}"#,
        );
        assert!(txpk.to_tx_packet(TxMode::Immediate, 0).is_err());
    }

    #[test]
    fn test_modulation_datr_mismatch() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"freq":868.8,"rfch":0,"modu":"FSK","datr":"SF7BW125",
                "fdev":25000,"size":1,"data":"AA=="}}"#,
        );
        assert!(txpk.to_tx_packet(TxMode::Immediate, 0).is_err());
    }

    #[test]
    fn test_mandatory_fields_enforced_by_decode() {
        // Missing freq.
        assert!(parse_pull_resp(
            br#"{"txpk":{"imme":true,"rfch":0,"modu":"LORA","datr":"SF7BW125",
                "codr":"4/5","size":1,"data":"AA=="}}"#
        )
        .is_err());
        // Unknown modulation.
        assert!(parse_pull_resp(
            br#"{"txpk":{"imme":true,"freq":868.1,"rfch":0,"modu":"OOK","datr":"SF7BW125",
                "codr":"4/5","size":1,"data":"AA=="}}"#
        )
        .is_err());
        // No txpk object at all.
        assert!(parse_pull_resp(br#"{"rxpk":[]}"#).is_err());
    }

    #[test]
    fn test_unpadded_base64_is_accepted() {
        let txpk = parse(
            r#"{"txpk":{"imme":true,"freq":868.1,"rfch":0,"modu":"LORA","datr":"SF7BW125",
                "codr":"4/5","size":5,"data":"aGVsbG8"}}"#,
        );
        let pkt = txpk.to_tx_packet(TxMode::Immediate, 0).unwrap();
        assert_eq!(pkt.payload, b"hello");
    }

    #[test]
    fn test_commented_body_is_tolerated() {
        let txpk = parse_pull_resp(
            br#"{"txpk":{ /* asap */ "imme":true,"freq":868.1,"rfch":0,"modu":"LORA",
                "datr":"SF7BW125","codr":"4/5","size":1,"data":"AA=="}}"#,
        )
        .unwrap();
        assert_eq!(txpk.timing().unwrap(), TxTiming::Immediate);
    }
}
