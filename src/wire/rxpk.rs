//! # Upstream Datagram Assembly
//!
//! Builds PUSH_DATA datagrams: the 12-byte header followed by a JSON object
//! holding an `rxpk` array and/or a piggybacked `stat` fragment. Field order
//! and number formats are part of the protocol (frequency in MHz with six
//! decimals, SNR with one, RSSI without), so the object is written out
//! field by field rather than through a serializer.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::constants::PKT_PUSH_DATA;
use crate::error::FwdError;
use crate::hal::{CrcStatus, DataRate, RxPacket};
use crate::wire::{request_header, GatewayId};

/// ISO 8601 with microsecond precision, the `time` field format.
pub const ISO8601_MICROS: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Formats a UTC instant the way the `time` field wants it.
pub fn format_utc(utc: DateTime<Utc>) -> String {
    utc.format(ISO8601_MICROS).to_string()
}

/// Incremental PUSH_DATA builder.
///
/// Push the surviving packets of one fetch cycle, then call
/// [`finish`](PushBuffer::finish); an empty cycle with no status report
/// yields no datagram at all.
pub struct PushBuffer {
    header: [u8; 12],
    json: String,
    pkt_count: usize,
}

impl PushBuffer {
    pub fn new(token: u16, gateway: GatewayId) -> Self {
        PushBuffer {
            header: request_header(PKT_PUSH_DATA, token, gateway),
            json: String::from("{\"rxpk\":["),
            pkt_count: 0,
        }
    }

    pub fn packet_count(&self) -> usize {
        self.pkt_count
    }

    /// Serializes one packet into the `rxpk` array. `time` is the
    /// already-formatted RX wall-clock timestamp, absent when neither GPS
    /// nor a local substitute applies.
    pub fn push_packet(&mut self, pkt: &RxPacket, time: Option<&str>) -> Result<(), FwdError> {
        self.append(pkt, time)
            .map_err(|_| FwdError::Other("datagram formatting failed".into()))
    }

    fn append(&mut self, pkt: &RxPacket, time: Option<&str>) -> std::fmt::Result {
        let stat = match pkt.status {
            CrcStatus::CrcOk => 1,
            CrcStatus::CrcBad => -1,
            CrcStatus::NoCrc => 0,
            // Filtered out before serialization; never forwarded.
            CrcStatus::Unknown => return Err(std::fmt::Error),
        };
        let j = &mut self.json;
        if self.pkt_count == 0 {
            j.push('{');
        } else {
            j.push_str(",{");
        }
        write!(j, "\"tmst\":{}", pkt.count_us)?;
        if let Some(t) = time {
            write!(j, ",\"time\":\"{t}\"")?;
        }
        write!(
            j,
            ",\"chan\":{},\"rfch\":{},\"freq\":{:.6}",
            pkt.if_chain,
            pkt.rf_chain,
            pkt.freq_hz as f64 / 1e6
        )?;
        write!(j, ",\"stat\":{stat}")?;
        match pkt.datarate {
            DataRate::Lora(sf) => {
                write!(
                    j,
                    ",\"modu\":\"LORA\",\"datr\":\"SF{}BW{}\"",
                    sf.as_number(),
                    pkt.bandwidth.as_khz()
                )?;
                write!(j, ",\"codr\":\"{}\"", pkt.coderate.as_str())?;
                write!(j, ",\"lsnr\":{:.1}", pkt.snr)?;
            }
            DataRate::Fsk(bps) => {
                write!(j, ",\"modu\":\"FSK\",\"datr\":{bps}")?;
            }
        }
        write!(j, ",\"rssi\":{:.0},\"size\":{}", pkt.rssi, pkt.payload.len())?;
        write!(j, ",\"data\":\"{}\"", BASE64.encode(&pkt.payload))?;
        j.push('}');
        self.pkt_count += 1;
        Ok(())
    }

    /// Closes the JSON object, splicing in a pending status fragment, and
    /// returns the complete datagram. `None` means there is nothing to send.
    pub fn finish(mut self, status: Option<&str>) -> Option<Vec<u8>> {
        if self.pkt_count == 0 {
            if status.is_none() {
                return None;
            }
            // Roll back the `"rxpk":[` prefix, keeping the opening brace.
            self.json.truncate(1);
        } else {
            self.json.push(']');
            if status.is_some() {
                self.json.push(',');
            }
        }
        if let Some(fragment) = status {
            self.json.push_str(fragment);
        }
        self.json.push('}');

        let mut out = Vec::with_capacity(12 + self.json.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(self.json.as_bytes());
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Bandwidth, CodeRate, SpreadingFactor};

    fn lora_packet() -> RxPacket {
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

    #[test]
    fn test_single_lora_packet_datagram() {
        let mut buffer = PushBuffer::new(0x0102, GatewayId::new(0xAA55_5A00_0000_0101));
        buffer
            .push_packet(&lora_packet(), Some("2023-04-17T10:22:15.123456Z"))
            .unwrap();
        let dgram = buffer.finish(None).unwrap();

        assert_eq!(dgram[0], 1);
        assert_eq!(&dgram[1..3], &[0x01, 0x02]);
        assert_eq!(dgram[3], 0);
        let json = std::str::from_utf8(&dgram[12..]).unwrap();
        assert_eq!(
            json,
            "{\"rxpk\":[{\"tmst\":3512337987,\
             \"time\":\"2023-04-17T10:22:15.123456Z\",\
             \"chan\":2,\"rfch\":0,\"freq\":868.300000,\"stat\":1,\
             \"modu\":\"LORA\",\"datr\":\"SF7BW125\",\"codr\":\"4/5\",\
             \"lsnr\":9.5,\"rssi\":-74,\"size\":4,\"data\":\"3q2+7w==\"}]}"
        );
        // The body must also be valid JSON.
        serde_json::from_str::<serde_json::Value>(json).unwrap();
    }

    #[test]
    fn test_time_field_is_optional() {
        let mut buffer = PushBuffer::new(0, GatewayId::new(0));
        buffer.push_packet(&lora_packet(), None).unwrap();
        let dgram = buffer.finish(None).unwrap();
        let json = std::str::from_utf8(&dgram[12..]).unwrap();
        assert!(!json.contains("\"time\""));
        assert!(json.contains("\"tmst\":3512337987,\"chan\":2"));
    }

    #[test]
    fn test_fsk_packet_fields() {
        let mut pkt = lora_packet();
        pkt.datarate = DataRate::Fsk(50_000);
        pkt.status = CrcStatus::NoCrc;
        let mut buffer = PushBuffer::new(0, GatewayId::new(0));
        buffer.push_packet(&pkt, None).unwrap();
        let json_bytes = buffer.finish(None).unwrap();
        let json = std::str::from_utf8(&json_bytes[12..]).unwrap();
        assert!(json.contains("\"stat\":0,\"modu\":\"FSK\",\"datr\":50000,\"rssi\":-74"));
        assert!(!json.contains("codr"));
        assert!(!json.contains("lsnr"));
    }

    #[test]
    fn test_packets_are_comma_separated() {
        let mut buffer = PushBuffer::new(0, GatewayId::new(0));
        buffer.push_packet(&lora_packet(), None).unwrap();
        buffer.push_packet(&lora_packet(), None).unwrap();
        assert_eq!(buffer.packet_count(), 2);
        let dgram = buffer.finish(None).unwrap();
        let json = std::str::from_utf8(&dgram[12..]).unwrap();
        serde_json::from_str::<serde_json::Value>(json).unwrap();
        assert!(json.contains("},{"));
    }

    #[test]
    fn test_empty_cycle_yields_no_datagram() {
        let buffer = PushBuffer::new(0, GatewayId::new(0));
        assert!(buffer.finish(None).is_none());
    }

    #[test]
    fn test_status_only_datagram_rolls_back_array() {
        let buffer = PushBuffer::new(0, GatewayId::new(0));
        let dgram = buffer.finish(Some("\"stat\":{\"rxnb\":4}")).unwrap();
        let json = std::str::from_utf8(&dgram[12..]).unwrap();
        assert_eq!(json, "{\"stat\":{\"rxnb\":4}}");
        serde_json::from_str::<serde_json::Value>(json).unwrap();
    }

    #[test]
    fn test_packets_and_status_combined() {
        let mut buffer = PushBuffer::new(0, GatewayId::new(0));
        buffer.push_packet(&lora_packet(), None).unwrap();
        let dgram = buffer.finish(Some("\"stat\":{\"rxnb\":4}")).unwrap();
        let json = std::str::from_utf8(&dgram[12..]).unwrap();
        assert!(json.ends_with("}],\"stat\":{\"rxnb\":4}}"));
        serde_json::from_str::<serde_json::Value>(json).unwrap();
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let mut pkt = lora_packet();
        pkt.status = CrcStatus::Unknown;
        let mut buffer = PushBuffer::new(0, GatewayId::new(0));
        assert!(buffer.push_packet(&pkt, None).is_err());
        assert_eq!(buffer.packet_count(), 0);
    }

    #[test]
    fn test_format_utc_microseconds() {
        use chrono::TimeZone;
        let utc = Utc.timestamp_opt(1_681_726_935, 123_456_000).unwrap();
        assert_eq!(format_utc(utc), "2023-04-17T10:22:15.123456Z");
    }
}
