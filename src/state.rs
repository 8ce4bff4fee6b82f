//! # Shared Gateway State
//!
//! Mutable state shared between the worker loops, grouped per concern with
//! one mutex each: the concentrator handle, the GPS time reference, the XTAL
//! correction, the two measurement counter groups, the GPS position, and the
//! status report hand-off buffer. The [`Context`] aggregate owns all of them
//! together with the resolved configuration and is passed to every loop
//! behind an `Arc`.
//!
//! Locking discipline: hold one lock at a time, never across a socket
//! operation or JSON work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::GatewayConfig;
use crate::constants::STATUS_SIZE;
use crate::hal::gps::{Coord, TimeRefSlot};
use crate::hal::Concentrator;

/// Upstream measurement group, reset at every statistics interval.
///
/// All counters saturate instead of wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamCounters {
    /// Packets fetched from the radio/ghost sources, including dropped ones.
    pub rx_rcv: u32,
    pub rx_ok: u32,
    pub rx_bad: u32,
    pub rx_nocrc: u32,
    /// Packets that passed the CRC filter and were serialized.
    pub up_pkt_fwd: u32,
    /// UDP bytes sent, all servers combined.
    pub up_network_byte: u32,
    /// Radio payload bytes forwarded.
    pub up_payload_byte: u32,
    pub up_dgram_sent: u32,
    pub up_ack_rcv: u32,
}

impl UpstreamCounters {
    /// Snapshot-and-reset; the only sanctioned read.
    pub fn take(&mut self) -> UpstreamCounters {
        std::mem::take(self)
    }
}

/// Downstream measurement group, reset at every statistics interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownstreamCounters {
    pub dw_pull_sent: u32,
    pub dw_ack_rcv: u32,
    /// PULL_RESP datagrams accepted (no decode error).
    pub dw_dgram_rcv: u32,
    pub dw_network_byte: u32,
    pub dw_payload_byte: u32,
    pub nb_tx_ok: u32,
    pub nb_tx_fail: u32,
}

impl DownstreamCounters {
    /// Snapshot-and-reset; the only sanctioned read.
    pub fn take(&mut self) -> DownstreamCounters {
        std::mem::take(self)
    }
}

/// Crystal-oscillator frequency correction factor.
///
/// Invariant: `valid == false` implies `value == 1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XtalCorrection {
    pub value: f64,
    pub valid: bool,
}

impl Default for XtalCorrection {
    fn default() -> Self {
        XtalCorrection {
            value: 1.0,
            valid: false,
        }
    }
}

impl XtalCorrection {
    pub fn reset(&mut self) {
        *self = XtalCorrection::default();
    }
}

/// Last GPS position obtained by the sync loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsMeas {
    pub coord_valid: bool,
    pub coord: Coord,
}

/// Hand-off buffer between the statistics reporter (producer) and the
/// upstream loop (consumer). A fresh report overwrites the previous one
/// whether or not it was consumed.
#[derive(Debug, Default)]
pub struct StatusReport {
    ready: AtomicBool,
    buf: Mutex<String>,
}

impl StatusReport {
    /// Stores a rendered report fragment and flags it ready. The fragment is
    /// bounded to the buffer size on a character boundary.
    pub fn publish(&self, mut fragment: String) {
        let max = STATUS_SIZE - 1;
        if fragment.len() > max {
            let mut end = max;
            while !fragment.is_char_boundary(end) {
                end -= 1;
            }
            fragment.truncate(end);
        }
        *self.buf.lock().unwrap() = fragment;
        self.ready.store(true, Ordering::Release);
    }

    /// Cheap readiness probe; a stale answer only delays the report by one
    /// fetch cycle.
    pub fn ready_hint(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Consumes the report if one is pending.
    pub fn take(&self) -> Option<String> {
        let buf = self.buf.lock().unwrap();
        if self.ready.swap(false, Ordering::AcqRel) {
            Some(buf.clone())
        } else {
            None
        }
    }
}

/// Cooperative shutdown flags, polled at every loop head.
///
/// `exit` asks for a clean shutdown (hardware stopped, sockets closed);
/// `quit` for a prompt one without hardware cleanup.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    exit: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag to register for SIGINT/SIGTERM.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit.clone()
    }

    /// The flag to register for SIGQUIT.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Either flavour of shutdown.
    pub fn is_requested(&self) -> bool {
        self.exit_requested() || self.quit_requested()
    }

    /// Sleeps up to `total`, returning early once shutdown is requested.
    pub fn interruptible_sleep(&self, total: Duration) {
        const CHUNK: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + total;
        while !self.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(CHUNK.min(deadline - now));
        }
    }
}

/// Everything the worker loops share.
pub struct Context {
    pub config: GatewayConfig,
    /// Serialises all radio operations.
    pub concentrator: Mutex<Box<dyn Concentrator>>,
    pub timeref: Mutex<TimeRefSlot>,
    pub xtal: Mutex<XtalCorrection>,
    pub meas_up: Mutex<UpstreamCounters>,
    pub meas_dw: Mutex<DownstreamCounters>,
    pub meas_gps: Mutex<GpsMeas>,
    pub status: StatusReport,
    /// Set by the GPS loop one second before the beacon slot, cleared by the
    /// downstream loop after emit or skip.
    pub beacon_armed: AtomicBool,
    pub shutdown: Shutdown,
    /// True when a real GPS device is feeding the sync loop (not faked, not
    /// disabled).
    pub gps_active: bool,
}

impl Context {
    pub fn new(
        config: GatewayConfig,
        concentrator: Box<dyn Concentrator>,
        gps_active: bool,
    ) -> Arc<Context> {
        Arc::new(Context {
            config,
            concentrator: Mutex::new(concentrator),
            timeref: Mutex::new(TimeRefSlot::default()),
            xtal: Mutex::new(XtalCorrection::default()),
            meas_up: Mutex::new(UpstreamCounters::default()),
            meas_dw: Mutex::new(DownstreamCounters::default()),
            meas_gps: Mutex::new(GpsMeas::default()),
            status: StatusReport::default(),
            beacon_armed: AtomicBool::new(false),
            shutdown: Shutdown::new(),
            gps_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_take_resets() {
        let mut counters = UpstreamCounters::default();
        counters.rx_rcv = 3;
        counters.up_pkt_fwd = 2;
        let snapshot = counters.take();
        assert_eq!(snapshot.rx_rcv, 3);
        assert_eq!(snapshot.up_pkt_fwd, 2);
        assert_eq!(counters, UpstreamCounters::default());
    }

    #[test]
    fn test_counters_saturate() {
        let mut counters = DownstreamCounters::default();
        counters.dw_network_byte = u32::MAX - 1;
        counters.dw_network_byte = counters.dw_network_byte.saturating_add(100);
        assert_eq!(counters.dw_network_byte, u32::MAX);
    }

    #[test]
    fn test_xtal_default_is_unity_invalid() {
        let xtal = XtalCorrection::default();
        assert_eq!(xtal.value, 1.0);
        assert!(!xtal.valid);
    }

    #[test]
    fn test_status_report_overwrite_and_take() {
        let report = StatusReport::default();
        assert!(report.take().is_none());
        report.publish("\"stat\":{\"rxnb\":1}".into());
        report.publish("\"stat\":{\"rxnb\":2}".into());
        assert!(report.ready_hint());
        assert_eq!(report.take().unwrap(), "\"stat\":{\"rxnb\":2}");
        assert!(report.take().is_none());
    }

    #[test]
    fn test_status_report_is_bounded() {
        let report = StatusReport::default();
        report.publish("x".repeat(STATUS_SIZE * 2));
        assert!(report.take().unwrap().len() < STATUS_SIZE);
    }

    #[test]
    fn test_shutdown_flags() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());
        shutdown.request_exit();
        assert!(shutdown.exit_requested());
        assert!(!shutdown.quit_requested());
        assert!(shutdown.is_requested());
    }
}
