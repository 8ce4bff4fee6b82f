//! # lorafwd - A Rust Crate for LoRa Gateway Packet Forwarding
//!
//! The lorafwd crate implements the gateway side of the Semtech UDP
//! forwarding protocol: it bridges a LoRa concentrator and up to four
//! network servers, keeps the gateway time-disciplined against GPS, and
//! broadcasts a class-B timing beacon.
//!
//! ## Features
//!
//! - Forward received radio frames to multiple servers as PUSH_DATA
//!   datagrams, with per-CRC-status filtering and acknowledgement tracking
//! - Poll each server for downlinks with PULL_DATA keep-alives and schedule
//!   the requested transmissions (immediate, on counter value, or on UTC
//!   time through the GPS time reference)
//! - Maintain a GPS time reference and a crystal-oscillator correction
//!   factor, and emit a 17-byte beacon on a configurable period
//! - Collect gateway statistics and piggyback a JSON status report on the
//!   upstream stream
//! - Inject ghost packets from a sidecar and run without radio hardware
//!   through a stand-in concentrator
//!
//! ## Usage
//!
//! The `lorafwd` binary wires the worker loops to a concentrator backend,
//! a GPS TTY and the configuration files. The library exposes the same
//! building blocks for integration and testing:
//!
//! ```rust,no_run
//! use lorafwd::{config, Context, SimConcentrator};
//!
//! let cfg = config::load(std::path::Path::new(".")).unwrap();
//! let ctx = Context::new(cfg, Box::new(SimConcentrator::new()), false);
//! ```

pub mod beacon;
pub mod config;
pub mod constants;
pub mod error;
pub mod ghost;
pub mod hal;
pub mod logging;
pub mod state;
pub mod transport;
pub mod util;
pub mod wire;
pub mod worker;

pub use crate::error::FwdError;
pub use crate::logging::{init_logger, log_info};

// Core gateway types
pub use config::{GatewayConfig, ServerConf};
pub use ghost::{PacketSource, UdpGhost};
pub use hal::gps::{Coord, Gps, TimeReference};
pub use hal::nmea::TtyGps;
pub use hal::sim::SimConcentrator;
pub use hal::{Concentrator, RxPacket, TxMode, TxPacket};
pub use state::Context;
pub use transport::ServerEndpoint;
pub use wire::GatewayId;
