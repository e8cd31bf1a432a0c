//! Timestamp engine.
//!
//! The link carries POSIX seconds in a shift register advanced by the
//! 1 Hz seconds tick; the tick counter between seconds comes from the
//! configured timestamp clock. This module owns the validity state
//! machine that decides whether those counters can be trusted, and the
//! conversion to (seconds past the control-system epoch, nanoseconds).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mrf_chip::evr::{self, control};
use mrf_chip::POSIX_TIME_AT_EPICS_EPOCH;

use crate::error::{MrfError, Result};
use crate::evr::event::EventTable;
use crate::io::RegWindow;
use crate::work::Scan;

/// A converted timestamp: seconds past the control-system epoch plus
/// nanoseconds into the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds past the 1990 epoch.
    pub sec: u32,
    /// Nanoseconds into the second.
    pub nsec: u32,
}

struct TsState {
    valid: bool,
    /// Last seconds value accepted by the tick validator. Zero whenever
    /// `valid` is false.
    last_valid: u32,
    /// Last seconds value that failed validation.
    last_invalid: u32,
    /// Timestamp clock in Hz; 0 until configured.
    clock_hz: f64,
}

/// Per-card timestamp engine.
pub struct TimeEngine {
    win: RegWindow,
    state: Mutex<TsState>,
    scan_valid: Arc<Scan>,
}

impl std::fmt::Debug for TimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("TimeEngine")
            .field("valid", &st.valid)
            .field("last_valid", &st.last_valid)
            .finish()
    }
}

impl TimeEngine {
    pub(crate) fn new(win: RegWindow) -> Arc<Self> {
        Arc::new(Self {
            win,
            state: Mutex::new(TsState {
                valid: false,
                last_valid: 0,
                last_invalid: 0,
                clock_hz: 0.0,
            }),
            scan_valid: Scan::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scan point fired on every validity transition.
    #[must_use]
    pub fn scan_valid_change(&self) -> &Arc<Scan> {
        &self.scan_valid
    }

    /// Whether timestamps can currently be trusted.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.lock().valid
    }

    /// Last seconds value accepted by the validator.
    #[must_use]
    pub fn last_valid_seconds(&self) -> u32 {
        self.lock().last_valid
    }

    /// Configure the timestamp tick rate in Hz.
    pub(crate) fn set_clock_hz(&self, hz: f64) {
        self.lock().clock_hz = hz;
    }

    /// Configured timestamp tick rate in Hz.
    #[must_use]
    pub fn clock_hz(&self) -> f64 {
        self.lock().clock_hz
    }

    fn mark_invalid(st: &mut TsState, seconds: u32) -> bool {
        st.last_invalid = seconds;
        st.last_valid = 0;
        if st.valid {
            st.valid = false;
            true
        } else {
            false
        }
    }

    /// Seconds-tick validation: called when the seconds-reset event comes
    /// out of the FIFO. Reads the live seconds counter without latching.
    pub fn on_seconds_tick(&self) {
        let seconds = self.win.read32(evr::TS_SEC);
        let changed = {
            let mut st = self.lock();
            if seconds == 0 || seconds == st.last_valid || seconds == st.last_invalid {
                Self::mark_invalid(&mut st, seconds)
            } else {
                st.last_valid = seconds;
                if st.valid {
                    false
                } else {
                    st.valid = true;
                    true
                }
            }
        };
        if changed {
            tracing::info!(seconds, valid = self.valid(), "timestamp validity changed");
            self.scan_valid.request();
        }
    }

    /// Link-down poll entry: the receiver is in error, so whatever the
    /// counters say is stale. Validity stays down until a fresh, distinct
    /// seconds value arrives.
    pub fn link_down_tick(&self) {
        let changed = {
            let mut st = self.lock();
            let last = st.last_valid;
            Self::mark_invalid(&mut st, last)
        };
        if changed {
            tracing::warn!("link down, timestamps invalidated");
            self.scan_valid.request();
        }
    }

    /// Resolve a timestamp.
    ///
    /// `event` 1..=255 returns the arrival time the FIFO stored for that
    /// code when one exists; anything else (and codes never seen) latches
    /// and reads the live counters.
    ///
    /// # Errors
    ///
    /// Fails while validity is down, and transitions to invalid when the
    /// counters produce an impossible time.
    pub fn get_time(&self, event: u32, table: &EventTable) -> Result<Timestamp> {
        if !self.valid() {
            return Err(MrfError::TimestampInvalid);
        }

        let stored = if (1..=255).contains(&event) {
            table.last_seen(event as u8)
        } else {
            None
        };

        let (sec, ticks) = match stored {
            Some(pair) => pair,
            None => self.latch_live(),
        };

        self.convert(sec, ticks)
    }

    /// Latch the live counters through the control register. The latch
    /// bit has no status readback and a known corruption glitch: verify
    /// the control value after clearing and re-write when it comes back
    /// wrong.
    fn latch_live(&self) -> (u32, u32) {
        let _irq = self.win.lock_irq();

        let ctrl = self.win.read32(evr::CONTROL);
        self.win.write32(evr::CONTROL, ctrl | control::TSLTCH);

        let sec = self.win.read32(evr::TS_SEC_LATCH);
        let ticks = self.win.read32(evr::TS_EVT_LATCH);

        let restored = ctrl & !control::TSLTCH;
        self.win.write32(evr::CONTROL, restored);
        let back = self.win.read32(evr::CONTROL);
        if back != restored {
            tracing::warn!(
                wrote = format_args!("{restored:#010x}"),
                read = format_args!("{back:#010x}"),
                "control register corrupted by timestamp latch, re-writing"
            );
            self.win.write32(evr::CONTROL, restored);
        }

        (sec, ticks)
    }

    fn convert(&self, link_sec: u32, ticks: u32) -> Result<Timestamp> {
        let mut invalidate = false;
        let result = {
            let mut st = self.lock();

            if link_sec == st.last_invalid
                || (st.last_valid != 0 && link_sec > st.last_valid + 1)
                || link_sec < POSIX_TIME_AT_EPICS_EPOCH
            {
                invalidate = Self::mark_invalid(&mut st, link_sec);
                Err(MrfError::TimestampInvalid)
            } else if st.clock_hz <= 0.0 || !st.clock_hz.is_finite() {
                Err(MrfError::range("timestamp clock", 0u32, 0u32))
            } else {
                let period_ns = 1e9 / st.clock_hz;
                let nsec = (f64::from(ticks) * period_ns).round();
                if nsec >= 1e9 {
                    // A tick count past one second means the 1 Hz reset
                    // arrived late; the counters cannot be trusted.
                    invalidate = Self::mark_invalid(&mut st, link_sec);
                    Err(MrfError::TimestampInvalid)
                } else {
                    Ok(Timestamp {
                        sec: link_sec - POSIX_TIME_AT_EPICS_EPOCH,
                        nsec: nsec as u32,
                    })
                }
            }
        };
        if invalidate {
            self.scan_valid.request();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use crate::work::CallbackEngine;
    use std::time::Duration;

    fn engine_pair() -> (Arc<SimCard>, Arc<TimeEngine>, Arc<EventTable>) {
        let sim = Arc::new(SimCard::evr());
        let win = RegWindow::new(Arc::clone(&sim) as Arc<dyn RegIo>);
        let table = EventTable::new(win.clone(), CallbackEngine::manual(), Duration::ZERO);
        let time = TimeEngine::new(win);
        time.set_clock_hz(1e9);
        (sim, time, table)
    }

    fn make_valid(sim: &SimCard, time: &TimeEngine, seconds: u32) {
        sim.poke32(evr::TS_SEC, seconds);
        time.on_seconds_tick();
        assert!(time.valid());
    }

    #[test]
    fn tick_validation_accepts_fresh_seconds() {
        let (sim, time, _t) = engine_pair();
        assert!(!time.valid());
        make_valid(&sim, &time, 0x6000_0010);
        assert_eq!(time.last_valid_seconds(), 0x6000_0010);
        assert_eq!(time.scan_valid_change().count(), 1);
    }

    #[test]
    fn repeated_or_zero_seconds_invalidate() {
        let (sim, time, _t) = engine_pair();
        make_valid(&sim, &time, 0x6000_0010);
        // Same value again: the shift register did not advance.
        time.on_seconds_tick();
        assert!(!time.valid());
        assert_eq!(time.last_valid_seconds(), 0);
        // A fresh value recovers.
        make_valid(&sim, &time, 0x6000_0012);
        // Zero kills it.
        sim.poke32(evr::TS_SEC, 0);
        time.on_seconds_tick();
        assert!(!time.valid());
    }

    #[test]
    fn get_time_fails_while_invalid() {
        let (_sim, time, table) = engine_pair();
        assert!(matches!(
            time.get_time(0, &table),
            Err(MrfError::TimestampInvalid)
        ));
    }

    #[test]
    fn live_latch_path_converts() {
        let (sim, time, table) = engine_pair();
        make_valid(&sim, &time, 0x6000_0010);
        sim.poke32(evr::TS_EVT, 12345);
        let ts = time.get_time(0, &table).unwrap();
        assert_eq!(ts.sec, 0x6000_0010 - POSIX_TIME_AT_EPICS_EPOCH);
        assert_eq!(ts.nsec, 12345);
    }

    #[test]
    fn control_glitch_is_repaired() {
        let (sim, time, table) = engine_pair();
        make_valid(&sim, &time, 0x6000_0010);
        let before = sim.peek32(evr::CONTROL);
        sim.arm_control_glitch();
        let _ = time.get_time(0, &table).unwrap();
        assert_eq!(sim.peek32(evr::CONTROL), before);
    }

    #[test]
    fn late_second_reset_invalidates() {
        let (sim, time, table) = engine_pair();
        make_valid(&sim, &time, 0x6000_0010);
        time.set_clock_hz(1e6); // 1 kHz tick would overflow fast
        sim.poke32(evr::TS_EVT, 2_000_000); // two seconds worth of ticks
        assert!(time.get_time(0, &table).is_err());
        assert!(!time.valid());
        assert_eq!(time.scan_valid_change().count(), 2);
    }

    #[test]
    fn link_down_is_monotonic_until_fresh_seconds() {
        let (sim, time, _t) = engine_pair();
        make_valid(&sim, &time, 0x6000_0010);
        time.link_down_tick();
        assert!(!time.valid());
        let transitions = time.scan_valid_change().count();
        // Repeated polls while down do not flap.
        time.link_down_tick();
        time.link_down_tick();
        assert_eq!(time.scan_valid_change().count(), transitions);
        // The old seconds value is now tainted; only a distinct one recovers.
        sim.poke32(evr::TS_SEC, 0x6000_0010);
        time.on_seconds_tick();
        assert!(!time.valid());
        make_valid(&sim, &time, 0x6000_0012);
    }
}
