//! # Beacon Frame
//!
//! Builds the 17-byte class-B timing beacon emitted on a PPS pulse: network
//! identifier, the UTC second the pulse will mark, gateway position mapped to
//! signed 24-bit fields, and two CRCs. Radio parameters are fixed by the
//! LoRaWAN beacon layout; only the TX frequency varies, corrected by the
//! crystal-oscillator factor.

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_16_IBM_3740};

use crate::constants::BEACON_NET_ID;
use crate::hal::gps::Coord;
use crate::hal::{Bandwidth, CodeRate, DataRate, SpreadingFactor, TxMode, TxPacket};

/// CCITT CRC-16 covering the optional part of the payload.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16 over `data`, polynomial 0x1021, init 0xFFFF.
pub fn crc16_ccit(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-8 over `data`, polynomial 0x87, init 0xFF. This variant matches no
/// catalogued algorithm, so it is implemented here next to its only user.
pub fn crc8_ccit(data: &[u8]) -> u8 {
    let mut x: u8 = 0xFF;
    for &byte in data {
        x ^= byte;
        for _ in 0..8 {
            x = if x & 0x80 != 0 { (x << 1) ^ 0x87 } else { x << 1 };
        }
    }
    x
}

/// Builds the beacon frame for the PPS pulse following `utc_at_pps`.
///
/// `utc_at_pps` is the UTC time of the last PPS; the broadcast time field is
/// the second after it, since the beacon is prepared one second ahead and
/// leaves on the next pulse.
pub fn beacon_packet(
    utc_at_pps: DateTime<Utc>,
    coord: Coord,
    xtal_correct: f64,
    beacon_freq_hz: u32,
) -> TxPacket {
    let mut payload = vec![0u8; 17];

    payload[0..3].copy_from_slice(&BEACON_NET_ID.to_le_bytes()[0..3]);

    let field_time = (utc_at_pps.timestamp() + 1) as u32;
    payload[3..7].copy_from_slice(&field_time.to_le_bytes());
    payload[7] = crc8_ccit(&payload[0..7]);

    // Info descriptor, unused.
    payload[8] = 0;

    let field_latitude = (((coord.lat / 90.0) * 8_388_608.0) as i32)
        .clamp(-8_388_608, 8_388_607);
    payload[9..12].copy_from_slice(&field_latitude.to_le_bytes()[0..3]);

    // +180 and -180 degrees alias to the same 24-bit value.
    let field_longitude = (((coord.lon / 180.0) * 8_388_608.0) as i32) & 0x00FF_FFFF;
    payload[12..15].copy_from_slice(&field_longitude.to_le_bytes()[0..3]);

    let field_crc2 = crc16_ccit(&payload[8..15]);
    payload[15..17].copy_from_slice(&field_crc2.to_le_bytes());

    TxPacket {
        tx_mode: TxMode::OnGps,
        count_us: 0,
        freq_hz: (xtal_correct * beacon_freq_hz as f64).round() as u32,
        rf_chain: 0,
        rf_power: 14,
        datarate: DataRate::Lora(SpreadingFactor::Sf9),
        bandwidth: Bandwidth::Khz125,
        coderate: CodeRate::Cr4_5,
        invert_pol: true,
        preamble: 6,
        no_crc: true,
        no_header: true,
        f_dev_khz: 0,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn coord() -> Coord {
        Coord {
            lat: 48.858,
            lon: 2.295,
            alt: 35,
        }
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/IBM-3740 catalogue check value.
        assert_eq!(crc16_ccit(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc8_vectors() {
        assert_eq!(crc8_ccit(&[]), 0xFF);
        assert_eq!(crc8_ccit(&[0x00]), 0x58);
    }

    #[test]
    fn test_beacon_payload_layout() {
        // One second before a 128 s period boundary.
        let utc = Utc.timestamp_opt(128 * 13_000_000 - 1, 0).unwrap();
        let pkt = beacon_packet(utc, coord(), 1.0, 869_525_000);

        assert_eq!(pkt.payload.len(), 17);
        assert_eq!(pkt.size(), 17);
        assert_eq!(&pkt.payload[0..3], &[0xEE, 0xFF, 0xC0]);
        let field_time = u32::from_le_bytes(pkt.payload[3..7].try_into().unwrap());
        assert_eq!(field_time, 128 * 13_000_000);
        assert_eq!(pkt.payload[7], crc8_ccit(&pkt.payload[0..7]));
        assert_eq!(pkt.payload[8], 0);
        let crc2 = u16::from_le_bytes(pkt.payload[15..17].try_into().unwrap());
        assert_eq!(crc2, crc16_ccit(&pkt.payload[8..15]));
    }

    #[test]
    fn test_beacon_radio_parameters() {
        let utc = Utc.timestamp_opt(1_000, 0).unwrap();
        let pkt = beacon_packet(utc, coord(), 1.0, 869_525_000);
        assert_eq!(pkt.tx_mode, TxMode::OnGps);
        assert_eq!(pkt.freq_hz, 869_525_000);
        assert_eq!(pkt.rf_power, 14);
        assert_eq!(pkt.datarate, DataRate::Lora(SpreadingFactor::Sf9));
        assert_eq!(pkt.bandwidth, Bandwidth::Khz125);
        assert_eq!(pkt.coderate, CodeRate::Cr4_5);
        assert!(pkt.invert_pol);
        assert_eq!(pkt.preamble, 6);
        assert!(pkt.no_crc);
        assert!(pkt.no_header);
        assert_eq!(pkt.rf_chain, 0);
    }

    #[test]
    fn test_frequency_correction_rounds() {
        let utc = Utc.timestamp_opt(1_000, 0).unwrap();
        let pkt = beacon_packet(utc, coord(), 1.000_001, 869_525_000);
        assert_eq!(pkt.freq_hz, 869_525_870);
    }

    #[test]
    fn test_latitude_saturates() {
        let utc = Utc.timestamp_opt(1_000, 0).unwrap();
        let north = beacon_packet(
            utc,
            Coord {
                lat: 90.0,
                lon: 0.0,
                alt: 0,
            },
            1.0,
            869_525_000,
        );
        // +90 N is represented as the largest positive 24-bit value.
        assert_eq!(&north.payload[9..12], &[0xFF, 0xFF, 0x7F]);

        let south = beacon_packet(
            utc,
            Coord {
                lat: -90.0,
                lon: 0.0,
                alt: 0,
            },
            1.0,
            869_525_000,
        );
        assert_eq!(&south.payload[9..12], &[0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_longitude_wraps() {
        let utc = Utc.timestamp_opt(1_000, 0).unwrap();
        let east = beacon_packet(
            utc,
            Coord {
                lat: 0.0,
                lon: 180.0,
                alt: 0,
            },
            1.0,
            869_525_000,
        );
        let west = beacon_packet(
            utc,
            Coord {
                lat: 0.0,
                lon: -180.0,
                alt: 0,
            },
            1.0,
            869_525_000,
        );
        assert_eq!(&east.payload[12..15], &[0x00, 0x00, 0x80]);
        assert_eq!(east.payload[12..15], west.payload[12..15]);
    }
}
