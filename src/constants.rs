//! Gateway Protocol Constants
//!
//! This module defines constants used by the Semtech UDP forwarding protocol
//! and the gateway worker loops.

/// Protocol version carried in every datagram header
pub const PROTOCOL_VERSION: u8 = 1;

// Datagram identifiers (byte 3 of the header)
pub const PKT_PUSH_DATA: u8 = 0;
pub const PKT_PUSH_ACK: u8 = 1;
pub const PKT_PULL_DATA: u8 = 2;
pub const PKT_PULL_RESP: u8 = 3;
pub const PKT_PULL_ACK: u8 = 4;

/// Maximum number of network servers a gateway talks to
pub const MAX_SERVERS: usize = 4;

/// Maximum number of packets per fetch/send cycle
pub const NB_PKT_MAX: usize = 8;

/// Default interval between PULL_DATA keep-alives, in seconds
pub const DEFAULT_KEEPALIVE_S: u64 = 5;

/// Default interval between statistics reports, in seconds
pub const DEFAULT_STAT_INTERVAL_S: u64 = 30;

/// Default PUSH_DATA acknowledgement time-out, in milliseconds; the upstream
/// socket waits half of this per receive slot
pub const PUSH_TIMEOUT_MS: u64 = 100;

/// Downstream socket receive time-out, in milliseconds
pub const PULL_TIMEOUT_MS: u64 = 200;

/// Maximum admitted age, in seconds, of the GPS time reference before it is
/// considered unusable
pub const GPS_REF_MAX_AGE_S: u64 = 30;

/// Pause when a fetch cycle returns no packets, in milliseconds
pub const FETCH_SLEEP_MS: u64 = 10;

/// Interval between beacon TX status polls, in milliseconds
pub const BEACON_POLL_MS: u64 = 50;

/// Total time allowed for a beacon to leave the air queue, in milliseconds
pub const BEACON_POLL_TOTAL_MS: u64 = 1500;

/// Number of raw error samples averaged for the initial XTAL correction
pub const XERR_INIT_AVG: u32 = 128;

/// Low-pass coefficient for XTAL error tracking
pub const XERR_FILT_COEF: f64 = 256.0;

// Preamble limits enforced on downlink requests
pub const MIN_LORA_PREAMBLE: u16 = 6;
pub const STD_LORA_PREAMBLE: u16 = 8;
pub const MIN_FSK_PREAMBLE: u16 = 3;
pub const STD_FSK_PREAMBLE: u16 = 4;

/// Status report buffer size; the rendered JSON fragment is at most one byte
/// shorter
pub const STATUS_SIZE: usize = 328;

/// Trigger counter value reported by a concentrator that silently reset
pub const TRIGCNT_RESET_SENTINEL: u32 = 0x7E00_0000;

/// Network identifier broadcast in beacon payload bytes 0..3
pub const BEACON_NET_ID: u32 = 0xC0_FFEE;
