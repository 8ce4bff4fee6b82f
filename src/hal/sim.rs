//! # Stand-In Concentrator
//!
//! `SimConcentrator` is the backend the binary wires in when no radio
//! hardware is attached: it never yields uplinks, accepts and logs downlinks,
//! and derives the free-running counter from the process monotonic clock.
//! Real deployments implement [`Concentrator`](crate::hal::Concentrator)
//! against their vendor HAL instead.

use std::time::Instant;

use log::{debug, info};

use crate::error::FwdError;
use crate::hal::{Concentrator, RxPacket, TxPacket, TxStatus};

pub struct SimConcentrator {
    epoch: Instant,
    started: bool,
}

impl SimConcentrator {
    pub fn new() -> Self {
        SimConcentrator {
            epoch: Instant::now(),
            started: false,
        }
    }

    fn counter(&self) -> u32 {
        // Free-running 32-bit microsecond counter, wrapping like the real
        // chip's.
        self.epoch.elapsed().as_micros() as u32
    }
}

impl Default for SimConcentrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Concentrator for SimConcentrator {
    fn start(&mut self) -> Result<(), FwdError> {
        self.epoch = Instant::now();
        self.started = true;
        info!("[sim] concentrator started, counter reset");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), FwdError> {
        self.started = false;
        Ok(())
    }

    fn receive(&mut self, _max: usize) -> Result<Vec<RxPacket>, FwdError> {
        Ok(Vec::new())
    }

    fn send(&mut self, pkt: &TxPacket) -> Result<(), FwdError> {
        if !self.started {
            return Err(FwdError::HalError("concentrator not started".into()));
        }
        debug!(
            "[sim] dropping {}-byte downlink at {} Hz ({:?})",
            pkt.size(),
            pkt.freq_hz,
            pkt.tx_mode
        );
        Ok(())
    }

    fn tx_status(&mut self) -> Result<TxStatus, FwdError> {
        Ok(TxStatus::Free)
    }

    fn trig_cnt(&mut self) -> Result<u32, FwdError> {
        if !self.started {
            return Err(FwdError::HalError("concentrator not started".into()));
        }
        Ok(self.counter())
    }
}
