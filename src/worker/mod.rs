//! # Worker Loops
//!
//! The cooperating loops of the gateway: upstream ingest/forward, per-server
//! downstream poll/transmit, GPS time synchronization, crystal-correction
//! validation, and the statistics reporter that runs on the main thread.
//! Every loop polls the shutdown flags at its head and blocks only on
//! timeout-bounded operations.

pub mod downstream;
pub mod gps_sync;
pub mod stats;
pub mod upstream;
pub mod xtal;
