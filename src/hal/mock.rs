//! # Mock HAL
//!
//! Scriptable stand-ins for the concentrator and the GPS receiver, driving
//! the same traits as the real hardware. The integration tests queue frames
//! and sentences here and inspect what the worker loops did with them; the
//! handles are cheaply clonable so a test keeps one side while the runtime
//! context owns the other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::FwdError;
use crate::hal::gps::{Coord, Gps, NmeaKind};
use crate::hal::{Concentrator, RxPacket, TxPacket, TxStatus};

#[derive(Default)]
struct MockConcentratorState {
    started: bool,
    rx_queue: VecDeque<Vec<RxPacket>>,
    sent: Vec<TxPacket>,
    trig_cnt: u32,
    tx_status_seq: VecDeque<TxStatus>,
    fail_next_send: bool,
    fail_receive: bool,
}

/// In-memory concentrator double.
#[derive(Clone, Default)]
pub struct MockConcentrator {
    state: Arc<Mutex<MockConcentratorState>>,
}

impl MockConcentrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one batch to be returned by the next `receive` call.
    pub fn push_rx(&self, batch: Vec<RxPacket>) {
        self.state.lock().unwrap().rx_queue.push_back(batch);
    }

    /// Frames handed to `send` so far.
    pub fn sent(&self) -> Vec<TxPacket> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn set_trig_cnt(&self, value: u32) {
        self.state.lock().unwrap().trig_cnt = value;
    }

    /// Makes the next `send` call report a HAL error.
    pub fn fail_next_send(&self) {
        self.state.lock().unwrap().fail_next_send = true;
    }

    /// Makes every `receive` call report a HAL error.
    pub fn fail_receive(&self) {
        self.state.lock().unwrap().fail_receive = true;
    }

    /// Scripts the answers of subsequent `tx_status` calls; once exhausted,
    /// the status reads `Free`.
    pub fn script_tx_status(&self, seq: &[TxStatus]) {
        self.state.lock().unwrap().tx_status_seq = seq.iter().copied().collect();
    }
}

impl Concentrator for MockConcentrator {
    fn start(&mut self) -> Result<(), FwdError> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), FwdError> {
        self.state.lock().unwrap().started = false;
        Ok(())
    }

    fn receive(&mut self, max: usize) -> Result<Vec<RxPacket>, FwdError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_receive {
            return Err(FwdError::HalError("mock receive failure".into()));
        }
        let mut batch = state.rx_queue.pop_front().unwrap_or_default();
        batch.truncate(max);
        Ok(batch)
    }

    fn send(&mut self, pkt: &TxPacket) -> Result<(), FwdError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_send {
            state.fail_next_send = false;
            return Err(FwdError::HalError("mock send failure".into()));
        }
        state.sent.push(pkt.clone());
        Ok(())
    }

    fn tx_status(&mut self) -> Result<TxStatus, FwdError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.tx_status_seq.pop_front().unwrap_or(TxStatus::Free))
    }

    fn trig_cnt(&mut self) -> Result<u32, FwdError> {
        Ok(self.state.lock().unwrap().trig_cnt)
    }
}

#[derive(Default)]
struct MockGpsState {
    sentences: VecDeque<NmeaKind>,
    utc: Option<DateTime<Utc>>,
    coord: Option<Coord>,
}

/// In-memory GPS double; sentences are scripted, time and position are set
/// directly.
#[derive(Clone, Default)]
pub struct MockGps {
    state: Arc<Mutex<MockGpsState>>,
}

impl MockGps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sentence(&self, kind: NmeaKind) {
        self.state.lock().unwrap().sentences.push_back(kind);
    }

    pub fn set_utc(&self, utc: Option<DateTime<Utc>>) {
        self.state.lock().unwrap().utc = utc;
    }

    pub fn set_coordinates(&self, coord: Option<Coord>) {
        self.state.lock().unwrap().coord = coord;
    }
}

impl Gps for MockGps {
    fn read_sentence(&mut self) -> Result<NmeaKind, FwdError> {
        self.state
            .lock()
            .unwrap()
            .sentences
            .pop_front()
            .ok_or_else(|| FwdError::GpsError("sentence script exhausted".into()))
    }

    fn utc_time(&self) -> Result<DateTime<Utc>, FwdError> {
        self.state
            .lock()
            .unwrap()
            .utc
            .ok_or_else(|| FwdError::GpsError("no UTC time scripted".into()))
    }

    fn coordinates(&self) -> Result<Coord, FwdError> {
        self.state
            .lock()
            .unwrap()
            .coord
            .ok_or_else(|| FwdError::GpsError("no position scripted".into()))
    }
}
