//! Event-action table and FIFO drain.
//!
//! 256 mapping-RAM rows turn received event codes into hardware actions;
//! the same table carries the software side: per-code subscriber lists,
//! last-seen timestamps, and the re-arm state machine that throttles
//! notification delivery when a code arrives faster than its subscribers
//! can drain their work queues.
//!
//! The drain loop runs on a dedicated thread woken through a tiny bounded
//! mailbox by the interrupt handler; see [`DrainMsg`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use mrf_chip::evr::{self, action, irq, map_word};

use crate::error::{MrfError, Result};
use crate::io::RegWindow;
use crate::work::{CallbackEngine, Priority, Scan, NUM_PRIORITIES};

/// One entry drained from the hardware FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoEvent {
    /// Event code.
    pub code: u8,
    /// Link seconds counter at arrival.
    pub sec: u32,
    /// Timestamp tick counter at arrival.
    pub evt: u32,
}

/// Subscriber notification. Runs on the drain thread; must not call back
/// into the event table.
pub type EventCallback = Arc<dyn Fn(FifoEvent) + Send + Sync>;

/// Messages accepted by the drain thread's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMsg {
    /// The ISR saw FIFO work.
    Wake,
    /// Card teardown.
    Stop,
}

/// Mailbox depth between the ISR and the drain thread.
pub const DRAIN_MAILBOX_DEPTH: usize = 3;

/// Upper bound on FIFO entries consumed per wake-up.
const DRAIN_BURST: usize = 512;

struct EventSlot {
    interested: u32,
    callbacks: Vec<EventCallback>,
    /// Software copy of the four mapping words, one bit per action.
    map: [u32; 4],
    last_sec: u32,
    last_evt: u32,
    /// Outstanding re-arm sentinels; the slot is idle at zero.
    waitingfor: u8,
    /// The code re-arrived while sentinels were outstanding.
    again: bool,
    /// FIFO-save was turned off to shed overrate load.
    save_disabled: bool,
}

impl EventSlot {
    const fn new() -> Self {
        Self {
            interested: 0,
            callbacks: Vec::new(),
            map: [0; 4],
            last_sec: 0,
            last_evt: 0,
            waitingfor: 0,
            again: false,
            save_disabled: false,
        }
    }
}

/// The per-card event-action table.
pub struct EventTable {
    win: RegWindow,
    engine: Arc<CallbackEngine>,
    /// Self-reference handed to re-arm sentinels, so queued work cannot
    /// keep a torn-down card alive.
    weak: Weak<EventTable>,
    slots: Mutex<Vec<EventSlot>>,
    occurred: Vec<Arc<Scan>>,
    min_period: Duration,
    last_drain: Mutex<Instant>,
    count_overflow: AtomicU32,
    count_sw_overrate: AtomicU32,
}

impl std::fmt::Debug for EventTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTable")
            .field("overflow", &self.count_overflow.load(Ordering::Relaxed))
            .field("sw_overrate", &self.count_sw_overrate.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventTable {
    pub(crate) fn new(
        win: RegWindow,
        engine: Arc<CallbackEngine>,
        min_period: Duration,
    ) -> Arc<Self> {
        let mut slots = Vec::with_capacity(256);
        slots.resize_with(256, EventSlot::new);
        Arc::new_cyclic(|weak| Self {
            win,
            engine,
            weak: weak.clone(),
            slots: Mutex::new(slots),
            occurred: (0..256).map(|_| Scan::new()).collect(),
            min_period,
            last_drain: Mutex::new(Instant::now()),
            count_overflow: AtomicU32::new(0),
            count_sw_overrate: AtomicU32::new(0),
        })
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<EventSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scan point fired every time `code` is drained from the FIFO.
    ///
    /// # Panics
    ///
    /// Code 0 is reserved.
    #[must_use]
    pub fn occurred(&self, code: u8) -> &Arc<Scan> {
        assert_ne!(code, 0, "event code 0 is reserved");
        &self.occurred[usize::from(code)]
    }

    /// Events silently lost to FIFO overflow-and-reset cycles.
    #[must_use]
    pub fn count_fifo_overflow(&self) -> u32 {
        self.count_overflow.load(Ordering::Relaxed)
    }

    /// Deliveries suppressed because a code out-ran its subscribers.
    #[must_use]
    pub fn count_fifo_sw_overrate(&self) -> u32 {
        self.count_sw_overrate.load(Ordering::Relaxed)
    }

    /// Timestamp captured when `code` last came out of the FIFO.
    #[must_use]
    pub fn last_seen(&self, code: u8) -> Option<(u32, u32)> {
        if code == 0 {
            return None;
        }
        let slots = self.lock_slots();
        let slot = &slots[usize::from(code)];
        if slot.last_sec == 0 && slot.last_evt == 0 {
            None
        } else {
            Some((slot.last_sec, slot.last_evt))
        }
    }

    fn check_action(code: u8, a: u32) -> Result<()> {
        if a > action::SPECIAL_LAST {
            return Err(MrfError::range("action", a, action::SPECIAL_LAST));
        }
        if a == action::LATCH_TS {
            // The latch is driven from the control register; mapping it as
            // well would race the two paths with no status bit to arbitrate.
            return Err(MrfError::range("action", a, action::LATCH_TS - 1));
        }
        let _ = code;
        Ok(())
    }

    /// Location of action `a` in a mapping-RAM row.
    const fn action_word(a: u32) -> (usize, u32) {
        let word = match a / 32 {
            0 => map_word::TRIGGER,
            1 => map_word::SET,
            2 => map_word::RESET,
            _ => map_word::INTERNAL,
        };
        (word, 1 << (a % 32))
    }

    /// Flip one action bit of `code`'s mapping-RAM row.
    ///
    /// # Errors
    ///
    /// Rejects unknown actions, the reserved latch action, and duplicate
    /// enables. Code 0 is inert: accepted, never written.
    pub fn map_action(&self, code: u8, a: u32, enable: bool) -> Result<()> {
        Self::check_action(code, a)?;
        if code == 0 {
            return Ok(());
        }
        let mut slots = self.lock_slots();
        self.apply_map(&mut slots[usize::from(code)], code, a, enable)
    }

    fn apply_map(&self, slot: &mut EventSlot, code: u8, a: u32, enable: bool) -> Result<()> {
        let idx = (a / 32) as usize;
        let bit = 1u32 << (a % 32);
        if enable && slot.map[idx] & bit != 0 {
            return Err(MrfError::DuplicateMapping { code, action: a });
        }
        if enable {
            slot.map[idx] |= bit;
        } else {
            slot.map[idx] &= !bit;
        }
        self.write_ram_bit(code, a, enable);
        Ok(())
    }

    /// Raw mapping-RAM update, without touching the software map. Used by
    /// the overrate shedding, which must not forget the subscription.
    fn write_ram_bit(&self, code: u8, a: u32, enable: bool) {
        let (word, mask) = Self::action_word(a);
        let off = evr::mapping_ram(0, usize::from(code), word);
        if enable {
            self.win.bit_set32(off, mask);
        } else {
            self.win.bit_clr32(off, mask);
        }
    }

    /// Whether action `a` is currently set in the hardware row of `code`.
    ///
    /// # Errors
    ///
    /// Same validation as [`EventTable::map_action`].
    pub fn is_action_mapped(&self, code: u8, a: u32) -> Result<bool> {
        Self::check_action(code, a)?;
        if code == 0 {
            return Ok(false);
        }
        let (word, mask) = Self::action_word(a);
        let off = evr::mapping_ram(0, usize::from(code), word);
        Ok(self.win.read32(off) & mask != 0)
    }

    /// Append `cb` to the notification list of `code`. The first
    /// subscriber turns on FIFO capture for the code.
    ///
    /// # Errors
    ///
    /// Code 0 carries no events.
    pub fn subscribe(&self, code: u8, cb: EventCallback) -> Result<()> {
        if code == 0 {
            return Err(MrfError::range("event code", 0u32, 255u32));
        }
        let mut slots = self.lock_slots();
        let slot = &mut slots[usize::from(code)];
        if slot.interested == 0 {
            self.apply_map(slot, code, action::FIFO_SAVE, true)?;
        }
        slot.callbacks.push(cb);
        slot.interested += 1;
        Ok(())
    }

    /// Remove `cb` from the notification list of `code`; the last
    /// unsubscribe turns FIFO capture back off.
    ///
    /// # Errors
    ///
    /// Fails when `cb` is not subscribed to `code`.
    pub fn unsubscribe(&self, code: u8, cb: &EventCallback) -> Result<()> {
        if code == 0 {
            return Err(MrfError::range("event code", 0u32, 255u32));
        }
        let mut slots = self.lock_slots();
        let slot = &mut slots[usize::from(code)];
        let pos = slot
            .callbacks
            .iter()
            .position(|c| Arc::ptr_eq(c, cb))
            .ok_or(MrfError::NotFound {
                id: u32::from(code),
            })?;
        slot.callbacks.remove(pos);
        slot.interested -= 1;
        if slot.interested == 0 {
            // The overrate path may have already shed the hardware bit.
            if slot.save_disabled {
                slot.save_disabled = false;
                let idx = (action::FIFO_SAVE / 32) as usize;
                slot.map[idx] &= !(1 << (action::FIFO_SAVE % 32));
            } else {
                self.apply_map(slot, code, action::FIFO_SAVE, false)?;
            }
        }
        Ok(())
    }

    /// Subscriber count for `code`.
    #[must_use]
    pub fn interested(&self, code: u8) -> u32 {
        self.lock_slots()[usize::from(code)].interested
    }

    /// One drain pass: consume up to [`DRAIN_BURST`] FIFO entries, deliver
    /// notifications, shed overrate load, recover from overflow, and
    /// re-arm the interrupt causes. Called from the drain thread on every
    /// mailbox wake; tests call it directly.
    pub fn drain_fifo_pass(&self) {
        // Rate throttle: don't let a chattering card monopolize the thread.
        if !self.min_period.is_zero() {
            let since = self
                .last_drain
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .elapsed();
            if since < self.min_period {
                std::thread::sleep(self.min_period - since);
            }
        }

        let mut saw_full = false;
        let mut saw_rxerr = false;
        let mut deliveries: Vec<(FifoEvent, Vec<EventCallback>)> = Vec::new();

        {
            let mut slots = self.lock_slots();
            for _ in 0..DRAIN_BURST {
                let status = self.win.read32(evr::IRQ_FLAG);
                saw_full |= status & irq::FIFOFULL != 0;
                if status & irq::RXERR != 0 {
                    saw_rxerr = true;
                    break;
                }
                if status & irq::EVENT == 0 {
                    break;
                }

                let mut code = self.win.read32(evr::EVT_FIFO_CODE);
                if code == 0 {
                    break;
                }
                if code > 255 {
                    // Bus glitch on the read; retry once.
                    code = self.win.read32(evr::EVT_FIFO_CODE);
                    if code == 0 || code > 255 {
                        tracing::warn!(code, "implausible FIFO event code, drain aborted");
                        break;
                    }
                }
                let code = code as u8;

                let sec = self.win.read32(evr::EVT_FIFO_SEC);
                let evt = self.win.read32(evr::EVT_FIFO_EVT);

                let slot = &mut slots[usize::from(code)];
                slot.last_sec = sec;
                slot.last_evt = evt;

                if slot.waitingfor == 0 {
                    slot.waitingfor = NUM_PRIORITIES as u8;
                    deliveries.push((FifoEvent { code, sec, evt }, slot.callbacks.clone()));
                } else {
                    slot.again = true;
                    if !slot.save_disabled {
                        self.write_ram_bit(code, action::FIFO_SAVE, false);
                        slot.save_disabled = true;
                    }
                    self.count_sw_overrate.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for (ev, cbs) in deliveries {
            for cb in &cbs {
                cb(ev);
            }
            self.occurred[usize::from(ev.code)].request();
            for prio in [Priority::Low, Priority::Medium, Priority::High] {
                let weak = self.weak.clone();
                let code = ev.code;
                self.engine.request(
                    prio,
                    Box::new(move || {
                        if let Some(table) = weak.upgrade() {
                            table.sentinel_done(code);
                        }
                    }),
                );
            }
        }

        if saw_full {
            self.count_overflow.fetch_add(1, Ordering::Relaxed);
        }
        if saw_full || saw_rxerr {
            // Events between reset and re-enable are lost; counted above.
            self.win.bit_set32(evr::CONTROL, evr::control::FIFORST);
        }

        {
            let _irq = self.win.lock_irq();
            let e = self.win.read32(evr::IRQ_ENABLE);
            self.win
                .write32(evr::IRQ_ENABLE, e | irq::EVENT | irq::FIFOFULL | irq::MASTER);
        }

        *self
            .last_drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// One re-arm sentinel returned from a priority queue. When the last
    /// sentinel of a slot lands and the code re-arrived meanwhile, FIFO
    /// capture is restored for its subscribers.
    fn sentinel_done(&self, code: u8) {
        let mut slots = self.lock_slots();
        let slot = &mut slots[usize::from(code)];
        slot.waitingfor = slot.waitingfor.saturating_sub(1);
        if slot.waitingfor == 0 && slot.again {
            slot.again = false;
            if slot.save_disabled {
                slot.save_disabled = false;
                if slot.interested > 0 {
                    self.write_ram_bit(code, action::FIFO_SAVE, true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;

    fn table() -> (Arc<SimCard>, Arc<EventTable>) {
        let sim = Arc::new(SimCard::evr());
        let win = RegWindow::new(Arc::clone(&sim) as Arc<dyn RegIo>);
        let engine = CallbackEngine::manual();
        (sim, EventTable::new(win, engine, Duration::ZERO))
    }

    #[test]
    fn map_round_trip_every_legal_action() {
        let (_sim, t) = table();
        for a in (0..=127).filter(|&a| a != action::LATCH_TS) {
            t.map_action(10, a, true).unwrap();
            assert!(t.is_action_mapped(10, a).unwrap(), "action {a}");
            t.map_action(10, a, false).unwrap();
            assert!(!t.is_action_mapped(10, a).unwrap(), "action {a}");
        }
    }

    #[test]
    fn latch_action_is_reserved() {
        let (_sim, t) = table();
        assert!(t.map_action(10, action::LATCH_TS, true).is_err());
        assert!(t.map_action(10, 128, true).is_err());
    }

    #[test]
    fn duplicate_mapping_rejected() {
        let (_sim, t) = table();
        t.map_action(7, 3, true).unwrap();
        assert!(matches!(
            t.map_action(7, 3, true),
            Err(MrfError::DuplicateMapping { code: 7, action: 3 })
        ));
        // Clearing twice is a harmless no-op.
        t.map_action(7, 3, false).unwrap();
        t.map_action(7, 3, false).unwrap();
    }

    #[test]
    fn code_zero_is_inert() {
        let (sim, t) = table();
        t.map_action(0, 5, true).unwrap();
        assert!(!t.is_action_mapped(0, 5).unwrap());
        assert_eq!(sim.peek32(evr::mapping_ram(0, 0, map_word::TRIGGER)), 0);
        assert!(t.subscribe(0, Arc::new(|_| {})).is_err());
    }

    #[test]
    fn subscribe_drives_fifo_save() {
        let (sim, t) = table();
        let cb: EventCallback = Arc::new(|_| {});
        t.subscribe(10, Arc::clone(&cb)).unwrap();
        let internal = sim.peek32(evr::mapping_ram(0, 10, map_word::INTERNAL));
        assert_ne!(internal & (1 << (action::FIFO_SAVE % 32)), 0);

        let cb2: EventCallback = Arc::new(|_| {});
        t.subscribe(10, Arc::clone(&cb2)).unwrap();
        assert_eq!(t.interested(10), 2);

        t.unsubscribe(10, &cb).unwrap();
        assert!(t.is_action_mapped(10, action::FIFO_SAVE).unwrap());
        t.unsubscribe(10, &cb2).unwrap();
        assert!(!t.is_action_mapped(10, action::FIFO_SAVE).unwrap());
        assert!(t.unsubscribe(10, &cb2).is_err());
    }

    #[test]
    fn drain_delivers_in_order_and_stores_last_seen() {
        let (sim, t) = table();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        t.subscribe(10, Arc::new(move |ev| s.lock().unwrap().push(ev)))
            .unwrap();

        sim.push_fifo(10, 100, 1);
        t.drain_fifo_pass();
        t.engine.pump_all();
        sim.push_fifo(10, 101, 2);
        t.drain_fifo_pass();
        t.engine.pump_all();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], FifoEvent { code: 10, sec: 100, evt: 1 });
        assert_eq!(seen[1], FifoEvent { code: 10, sec: 101, evt: 2 });
        assert_eq!(t.last_seen(10), Some((101, 2)));
        assert_eq!(t.occurred(10).count(), 2);
    }

    #[test]
    fn drain_terminates_within_burst_bound() {
        let (sim, t) = table();
        for _ in 0..600 {
            sim.push_fifo(20, 1, 1);
        }
        // 512 of the 600 fit in the hardware FIFO; one pass must finish.
        t.drain_fifo_pass();
        t.engine.pump_all();
    }
}
