//! # Concentrator Hardware Abstraction
//!
//! This module defines the data model shared with the LoRa concentrator and
//! the `Concentrator` trait through which the worker loops drive it. A single
//! mutex in the runtime context serialises every call on the trait; at most
//! one of packet fetch, downlink TX, beacon TX and trigger-counter read runs
//! at a time.

pub mod gps;
pub mod mock;
pub mod nmea;
pub mod sim;

use crate::error::FwdError;

/// Modulation scheme of a radio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Lora,
    Fsk,
}

impl Modulation {
    /// Protocol identifier as carried in the JSON `modu` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modulation::Lora => "LORA",
            Modulation::Fsk => "FSK",
        }
    }
}

/// LoRa spreading factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadingFactor {
    Sf7 = 7,
    Sf8 = 8,
    Sf9 = 9,
    Sf10 = 10,
    Sf11 = 11,
    Sf12 = 12,
}

impl SpreadingFactor {
    pub fn as_number(&self) -> u8 {
        *self as u8
    }

    pub fn from_number(sf: u8) -> Option<Self> {
        match sf {
            7 => Some(SpreadingFactor::Sf7),
            8 => Some(SpreadingFactor::Sf8),
            9 => Some(SpreadingFactor::Sf9),
            10 => Some(SpreadingFactor::Sf10),
            11 => Some(SpreadingFactor::Sf11),
            12 => Some(SpreadingFactor::Sf12),
            _ => None,
        }
    }
}

/// Channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn as_khz(&self) -> u32 {
        match self {
            Bandwidth::Khz125 => 125,
            Bandwidth::Khz250 => 250,
            Bandwidth::Khz500 => 500,
        }
    }

    pub fn from_khz(khz: u32) -> Option<Self> {
        match khz {
            125 => Some(Bandwidth::Khz125),
            250 => Some(Bandwidth::Khz250),
            500 => Some(Bandwidth::Khz500),
            _ => None,
        }
    }
}

/// LoRa error-correction coding rate. `Off` covers frames reported by the
/// concentrator without a coding rate (mostly false syncs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
    Off,
}

impl CodeRate {
    /// Protocol identifier as carried in the JSON `codr` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeRate::Cr4_5 => "4/5",
            CodeRate::Cr4_6 => "4/6",
            CodeRate::Cr4_7 => "4/7",
            CodeRate::Cr4_8 => "4/8",
            CodeRate::Off => "OFF",
        }
    }
}

/// Data rate, discriminating the modulation: a spreading factor for LoRa, a
/// bit rate in bits per second for FSK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora(SpreadingFactor),
    Fsk(u32),
}

impl DataRate {
    pub fn modulation(&self) -> Modulation {
        match self {
            DataRate::Lora(_) => Modulation::Lora,
            DataRate::Fsk(_) => Modulation::Fsk,
        }
    }
}

/// CRC status of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    CrcOk,
    CrcBad,
    NoCrc,
    Unknown,
}

/// A frame received by the concentrator (or injected by a ghost source).
#[derive(Debug, Clone)]
pub struct RxPacket {
    /// Free-running concentrator counter at RX, in microseconds.
    pub count_us: u32,
    /// RX center frequency, in Hz.
    pub freq_hz: u32,
    /// Concentrator IF channel the frame was received on.
    pub if_chain: u8,
    /// Concentrator RF chain the frame was received on.
    pub rf_chain: u8,
    pub status: CrcStatus,
    pub datarate: DataRate,
    pub bandwidth: Bandwidth,
    /// Meaningful for LoRa frames only.
    pub coderate: CodeRate,
    /// Average RSSI, in dBm.
    pub rssi: f32,
    /// Average signal-to-noise ratio, in dB (LoRa only).
    pub snr: f32,
    /// Raw payload, at most 255 bytes.
    pub payload: Vec<u8>,
}

impl RxPacket {
    pub fn size(&self) -> u16 {
        self.payload.len() as u16
    }
}

/// When a downlink frame leaves the antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// As soon as the concentrator accepts the frame.
    Immediate,
    /// When the free-running counter reaches `count_us`.
    Timestamped,
    /// On the next GPS PPS pulse.
    OnGps,
}

/// A frame to be emitted by the concentrator.
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub tx_mode: TxMode,
    /// Target counter value; meaningful for `Timestamped` only.
    pub count_us: u32,
    /// TX center frequency, in Hz.
    pub freq_hz: u32,
    pub rf_chain: u8,
    /// TX power, in dBm.
    pub rf_power: i8,
    pub datarate: DataRate,
    pub bandwidth: Bandwidth,
    pub coderate: CodeRate,
    /// Invert signal polarity (LoRa downlinks).
    pub invert_pol: bool,
    /// Preamble length, in symbols.
    pub preamble: u16,
    /// Do not append a payload CRC.
    pub no_crc: bool,
    /// Emit an implicit-header frame.
    pub no_header: bool,
    /// FSK frequency deviation, in kHz (FSK only).
    pub f_dev_khz: u8,
    pub payload: Vec<u8>,
}

impl TxPacket {
    pub fn size(&self) -> u16 {
        self.payload.len() as u16
    }
}

/// TX path state as reported by the concentrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Nothing queued, the air interface is available.
    Free,
    Emitting,
    Scheduled,
    Unknown,
}

/// Operations of the LoRa concentrator.
///
/// Implementations sit on top of the vendor HAL; every method is called with
/// the context's concentrator mutex held.
pub trait Concentrator: Send {
    /// Starts the radio. Required before any other operation.
    fn start(&mut self) -> Result<(), FwdError>;

    /// Stops the radio and releases the hardware.
    fn stop(&mut self) -> Result<(), FwdError>;

    /// Fetches up to `max` received frames from the RX buffer.
    fn receive(&mut self, max: usize) -> Result<Vec<RxPacket>, FwdError>;

    /// Queues one frame for transmission.
    fn send(&mut self, pkt: &TxPacket) -> Result<(), FwdError>;

    /// Reports the state of the TX path.
    fn tx_status(&mut self) -> Result<TxStatus, FwdError>;

    /// Reads the counter value captured by hardware on the last PPS pulse.
    fn trig_cnt(&mut self) -> Result<u32, FwdError>;
}
