//! Soft-sequence engine and sequence-RAM manager.
//!
//! A soft sequence is the software-maintained list of
//! (event code, tick offset) rows a sequence RAM plays back. It moves
//! through an edit → commit → load → enable lifecycle; the manager owns
//! both the soft sequences and the two physical RAM slots and is the only
//! mutator of the binding between them, so neither side ever holds a
//! dangling reference to the other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mrf_chip::evg::{self, seq_ctrl, NUM_SEQ_RAM, SEQ_RAM_ROWS};
use mrf_chip::EVENT_SEQ_END;

use crate::error::{MrfError, Result};
use crate::io::RegWindow;
use crate::work::Scan;

/// Playback mode programmed into the RAM control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqRunMode {
    /// Disarm after one pass.
    Single,
    /// Re-arm automatically at the terminator.
    Auto,
    /// Stay armed; every external trigger plays one pass.
    External,
}

/// Lifecycle state of a soft sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    /// Nothing staged.
    Empty,
    /// Edited since the last commit.
    Dirty,
    /// Validated and frozen, not bound to a RAM.
    Committed,
    /// Bound to RAM `slot`, not armed.
    Loaded(usize),
    /// Bound to RAM `slot` and armed.
    Running(usize),
}

impl SeqState {
    fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Dirty => "Dirty",
            Self::Committed => "Committed",
            Self::Loaded(_) => "Loaded",
            Self::Running(_) => "Running",
        }
    }
}

struct CommittedSeq {
    codes: Vec<u8>,
    ticks: Vec<u32>,
}

struct SeqInner {
    codes: Vec<u8>,
    ticks: Vec<u64>,
    /// Ticks per second for seconds-denominated timestamp input.
    time_scale: f64,
    committed: Option<CommittedSeq>,
    dirty: bool,
    loaded: Option<usize>,
    running: bool,
    needs_sync: bool,
    trig_src: u32,
    run_mode: SeqRunMode,
}

/// One software-maintained sequence.
pub struct SoftSeq {
    id: usize,
    scan: Arc<Scan>,
    inner: Mutex<SeqInner>,
}

impl std::fmt::Debug for SoftSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftSeq")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SoftSeq {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            scan: Scan::new(),
            inner: Mutex::new(SeqInner {
                codes: Vec::new(),
                ticks: Vec::new(),
                time_scale: 0.0,
                committed: None,
                dirty: false,
                loaded: None,
                running: false,
                needs_sync: false,
                trig_src: 0,
                run_mode: SeqRunMode::Single,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SeqInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Manager-assigned id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Scan point fired on every lifecycle change.
    #[must_use]
    pub fn scan(&self) -> &Arc<Scan> {
        &self.scan
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SeqState {
        let inner = self.lock();
        Self::state_of(&inner)
    }

    fn state_of(inner: &SeqInner) -> SeqState {
        if inner.running {
            return SeqState::Running(inner.loaded.unwrap_or(0));
        }
        if inner.committed.is_some() && !inner.dirty {
            return match inner.loaded {
                Some(slot) => SeqState::Loaded(slot),
                None => SeqState::Committed,
            };
        }
        if inner.codes.is_empty() && inner.ticks.is_empty() {
            SeqState::Empty
        } else {
            SeqState::Dirty
        }
    }

    /// Replace the staged event codes. Un-commits.
    ///
    /// # Errors
    ///
    /// At most [`SEQ_RAM_ROWS`] rows fit a RAM.
    pub fn set_event_codes(&self, codes: &[u8]) -> Result<()> {
        if codes.len() > SEQ_RAM_ROWS {
            return Err(MrfError::range(
                "sequence length",
                codes.len() as u64,
                SEQ_RAM_ROWS as u64,
            ));
        }
        let mut inner = self.lock();
        inner.codes = codes.to_vec();
        inner.committed = None;
        inner.dirty = true;
        Ok(())
    }

    /// Replace the staged tick offsets. Un-commits.
    ///
    /// # Errors
    ///
    /// At most [`SEQ_RAM_ROWS`] rows fit a RAM.
    pub fn set_timestamps_ticks(&self, ticks: &[u64]) -> Result<()> {
        if ticks.len() > SEQ_RAM_ROWS {
            return Err(MrfError::range(
                "sequence length",
                ticks.len() as u64,
                SEQ_RAM_ROWS as u64,
            ));
        }
        let mut inner = self.lock();
        inner.ticks = ticks.to_vec();
        inner.committed = None;
        inner.dirty = true;
        Ok(())
    }

    /// Configure the tick rate used by [`SoftSeq::set_timestamps_sec`].
    ///
    /// # Errors
    ///
    /// Must be finite and positive.
    pub fn set_time_scale(&self, ticks_per_sec: f64) -> Result<()> {
        if ticks_per_sec <= 0.0 || !ticks_per_sec.is_finite() {
            return Err(MrfError::range("time scale", 0u32, 0u32));
        }
        self.lock().time_scale = ticks_per_sec;
        Ok(())
    }

    /// Replace the staged timestamps, expressed in seconds and rescaled
    /// by the configured time scale. Un-commits.
    ///
    /// # Errors
    ///
    /// Needs a configured time scale; rejects negative or non-finite
    /// values and over-long input.
    pub fn set_timestamps_sec(&self, seconds: &[f64]) -> Result<()> {
        if seconds.len() > SEQ_RAM_ROWS {
            return Err(MrfError::range(
                "sequence length",
                seconds.len() as u64,
                SEQ_RAM_ROWS as u64,
            ));
        }
        let mut inner = self.lock();
        if inner.time_scale <= 0.0 {
            return Err(MrfError::range("time scale", 0u32, 0u32));
        }
        let mut ticks = Vec::with_capacity(seconds.len());
        for &s in seconds {
            if !s.is_finite() || s < 0.0 {
                return Err(MrfError::range("sequence timestamp", 0u32, 0u32));
            }
            ticks.push((s * inner.time_scale).round() as u64);
        }
        inner.ticks = ticks;
        inner.committed = None;
        inner.dirty = true;
        Ok(())
    }

    /// Select the playback trigger.
    ///
    /// # Errors
    ///
    /// Valid sources are the eight multiplexed counters (0..=7) and the
    /// external/bus triggers (16..=18).
    pub fn set_trig_src(&self, src: u32) -> Result<()> {
        if src > 18 || (src > 7 && src < 16) {
            return Err(MrfError::range("sequence trigger source", src, 18u32));
        }
        self.lock().trig_src = src;
        Ok(())
    }

    /// Configured trigger source.
    #[must_use]
    pub fn trig_src(&self) -> u32 {
        self.lock().trig_src
    }

    /// Select the playback mode.
    pub fn set_run_mode(&self, mode: SeqRunMode) {
        self.lock().run_mode = mode;
    }

    /// Configured playback mode.
    #[must_use]
    pub fn run_mode(&self) -> SeqRunMode {
        self.lock().run_mode
    }

    /// Whether a sync against the RAM is outstanding.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.lock().needs_sync
    }

    /// Validate and freeze the staged rows.
    ///
    /// Checks size, matching lengths, non-decreasing timestamps and the
    /// u32 tick range, then appends the terminator when absent.
    ///
    /// # Errors
    ///
    /// Any validation failure leaves the staged rows untouched and the
    /// sequence uncommitted.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.committed.is_some() && !inner.dirty {
            return Ok(());
        }

        if inner.codes.len() != inner.ticks.len() {
            return Err(MrfError::range(
                "sequence lengths (codes vs timestamps)",
                inner.codes.len() as u64,
                inner.ticks.len() as u64,
            ));
        }
        let mut prev = 0u64;
        for (&t, _) in inner.ticks.iter().zip(&inner.codes) {
            if t < prev {
                return Err(MrfError::range("sequence timestamp order", t, prev));
            }
            if t > u64::from(u32::MAX) {
                return Err(MrfError::range("sequence timestamp", t, u64::from(u32::MAX)));
            }
            prev = t;
        }

        let mut codes = inner.codes.clone();
        let mut ticks: Vec<u32> = inner.ticks.iter().map(|&t| t as u32).collect();
        if codes.last() != Some(&EVENT_SEQ_END) {
            codes.push(EVENT_SEQ_END);
            ticks.push(ticks.last().map_or(0, |&t| t.saturating_add(1)));
        }
        if codes.len() > SEQ_RAM_ROWS {
            return Err(MrfError::range(
                "sequence length",
                codes.len() as u64,
                SEQ_RAM_ROWS as u64,
            ));
        }

        inner.committed = Some(CommittedSeq { codes, ticks });
        inner.dirty = false;
        if inner.loaded.is_some() {
            inner.needs_sync = true;
        }
        drop(inner);
        self.scan.request();
        Ok(())
    }
}

/// Owner of the soft sequences and the two sequence-RAM slots.
pub struct SeqMgr {
    win: RegWindow,
    slots: Mutex<[Option<usize>; NUM_SEQ_RAM]>,
    seqs: Mutex<Vec<Arc<SoftSeq>>>,
}

impl std::fmt::Debug for SeqMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqMgr")
            .field("bound", &self.bound_count())
            .finish()
    }
}

impl SeqMgr {
    pub(crate) fn new(win: RegWindow) -> Arc<Self> {
        Arc::new(Self {
            win,
            slots: Mutex::new([None; NUM_SEQ_RAM]),
            seqs: Mutex::new(Vec::new()),
        })
    }

    fn lock_slots(&self) -> MutexGuard<'_, [Option<usize>; NUM_SEQ_RAM]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new soft sequence and return its handle.
    pub fn create(&self) -> Arc<SoftSeq> {
        let mut seqs = self.seqs.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = SoftSeq::new(seqs.len());
        seqs.push(Arc::clone(&seq));
        seq
    }

    /// Soft sequence `id`.
    ///
    /// # Errors
    ///
    /// Unknown ids fail.
    pub fn soft_seq(&self, id: usize) -> Result<Arc<SoftSeq>> {
        self.seqs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(MrfError::NotFound { id: id as u32 })
    }

    /// Which soft sequence owns `slot`.
    #[must_use]
    pub fn slot_owner(&self, slot: usize) -> Option<usize> {
        self.lock_slots()[slot]
    }

    /// Number of bound RAM slots.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.lock_slots().iter().flatten().count()
    }

    fn write_ram(&self, slot: usize, rows: &CommittedSeq) {
        for (i, (&code, &tick)) in rows.codes.iter().zip(&rows.ticks).enumerate() {
            self.win.write32(evg::seq_ram_ts(slot, i), tick);
            self.win.write32(evg::seq_ram_code(slot, i), u32::from(code));
        }
    }

    fn ram_matches(&self, slot: usize, rows: &CommittedSeq) -> bool {
        rows.codes.iter().zip(&rows.ticks).enumerate().all(
            |(i, (&code, &tick))| {
                self.win.read32(evg::seq_ram_ts(slot, i)) == tick
                    && self.win.read32(evg::seq_ram_code(slot, i)) == u32::from(code)
            },
        )
    }

    /// Bind `id` to a free RAM slot and program it.
    ///
    /// # Errors
    ///
    /// The sequence must be committed and unbound; both slots taken is
    /// [`MrfError::NoFreeRam`].
    pub fn load(&self, id: usize) -> Result<usize> {
        let seq = self.soft_seq(id)?;
        let mut inner = seq.lock();
        match SoftSeq::state_of(&inner) {
            SeqState::Committed => {}
            other => {
                return Err(MrfError::SequenceState {
                    op: "load",
                    state: other.name(),
                })
            }
        }

        let slot = {
            let mut slots = self.lock_slots();
            let slot = slots
                .iter()
                .position(Option::is_none)
                .ok_or(MrfError::NoFreeRam)?;
            slots[slot] = Some(id);
            slot
        };

        let rows = inner.committed.as_ref().expect("state checked committed");
        self.write_ram(slot, rows);

        let mode_bits = match inner.run_mode {
            SeqRunMode::Single => seq_ctrl::SINGLE,
            SeqRunMode::Auto => seq_ctrl::RECYCLE,
            SeqRunMode::External => 0,
        };
        self.win.write32(
            evg::seq_ctrl(slot),
            mode_bits | (inner.trig_src & seq_ctrl::TRIG_MASK),
        );

        inner.loaded = Some(slot);
        drop(inner);
        seq.scan.request();
        tracing::info!(seq = id, slot, "sequence loaded");
        Ok(slot)
    }

    /// Release the RAM slot bound to `id`.
    ///
    /// # Errors
    ///
    /// Only a loaded, disarmed sequence can unload.
    pub fn unload(&self, id: usize) -> Result<()> {
        let seq = self.soft_seq(id)?;
        let mut inner = seq.lock();
        let slot = match SoftSeq::state_of(&inner) {
            SeqState::Loaded(slot) => slot,
            other => {
                return Err(MrfError::SequenceState {
                    op: "unload",
                    state: other.name(),
                })
            }
        };

        self.win.write32(evg::seq_ctrl(slot), 0);
        self.lock_slots()[slot] = None;
        inner.loaded = None;
        inner.needs_sync = false;
        drop(inner);
        seq.scan.request();
        tracing::info!(seq = id, slot, "sequence unloaded");
        Ok(())
    }

    /// Arm the RAM bound to `id`.
    ///
    /// # Errors
    ///
    /// Only a loaded, disarmed sequence can be enabled.
    pub fn enable(&self, id: usize) -> Result<()> {
        let seq = self.soft_seq(id)?;
        let mut inner = seq.lock();
        let slot = match SoftSeq::state_of(&inner) {
            SeqState::Loaded(slot) => slot,
            other => {
                return Err(MrfError::SequenceState {
                    op: "enable",
                    state: other.name(),
                })
            }
        };

        self.win.bit_set32(evg::seq_ctrl(slot), seq_ctrl::RESET);
        self.win.bit_set32(evg::seq_ctrl(slot), seq_ctrl::ENABLE);
        inner.running = true;
        drop(inner);
        seq.scan.request();
        Ok(())
    }

    /// Disarm the RAM bound to `id`. Disarming an already stopped
    /// sequence is a no-op.
    ///
    /// # Errors
    ///
    /// The sequence must be bound to a RAM.
    pub fn disable(&self, id: usize) -> Result<()> {
        let seq = self.soft_seq(id)?;
        let mut inner = seq.lock();
        let Some(slot) = inner.loaded else {
            return Err(MrfError::SequenceState {
                op: "disable",
                state: SoftSeq::state_of(&inner).name(),
            });
        };
        if !inner.running {
            return Ok(());
        }
        self.win.bit_set32(evg::seq_ctrl(slot), seq_ctrl::DISABLE);
        inner.running = false;
        drop(inner);
        seq.scan.request();
        Ok(())
    }

    /// First sync leg, run on the per-card update thread after the
    /// hardware reports a stop on `slot`: reconcile the soft state with
    /// the disarmed RAM and rewrite it when the committed rows differ.
    /// This is the only path that rewrites a bound RAM.
    ///
    /// Returns the owning sequence id for the finish leg, or `None` when
    /// the slot is unbound.
    pub fn update(&self, slot: usize) -> Option<usize> {
        let id = self.lock_slots().get(slot).copied().flatten()?;
        let Ok(seq) = self.soft_seq(id) else {
            return None;
        };

        let inner = &mut *seq.lock();
        let ctrl = self.win.read32(evg::seq_ctrl(slot));
        if ctrl & seq_ctrl::ENABLED == 0 {
            inner.running = false;
        }
        if ctrl & (seq_ctrl::RUNNING | seq_ctrl::ENABLED) != 0 {
            // Still armed (auto/external modes): the RAM must not be touched.
            return Some(id);
        }
        if let Some(rows) = &inner.committed {
            if !self.ram_matches(slot, rows) {
                tracing::debug!(seq = id, slot, "rewriting stopped sequence RAM");
                self.write_ram(slot, rows);
            }
        }
        Some(id)
    }

    /// Second sync leg, run on the high-priority callback worker: clear
    /// the outstanding-sync flag and notify.
    pub fn finish_update(&self, id: usize) {
        if let Ok(seq) = self.soft_seq(id) {
            seq.lock().needs_sync = false;
            seq.scan.request();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;

    fn mgr() -> (Arc<SimCard>, Arc<SeqMgr>) {
        let sim = Arc::new(SimCard::evg());
        let win = RegWindow::new(Arc::clone(&sim) as Arc<dyn RegIo>);
        (sim, SeqMgr::new(win))
    }

    #[test]
    fn commit_validates_ordering_and_terminates() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        seq.set_event_codes(&[1, 2, 3]).unwrap();
        seq.set_timestamps_ticks(&[100, 50, 200]).unwrap();
        assert!(seq.commit().is_err());
        assert_eq!(seq.state(), SeqState::Dirty);

        seq.set_timestamps_ticks(&[100, 150, 200]).unwrap();
        seq.commit().unwrap();
        assert_eq!(seq.state(), SeqState::Committed);
    }

    #[test]
    fn commit_rejects_mismatched_lengths_and_huge_ticks() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        seq.set_event_codes(&[1, 2]).unwrap();
        seq.set_timestamps_ticks(&[1]).unwrap();
        assert!(seq.commit().is_err());
        seq.set_timestamps_ticks(&[1, u64::from(u32::MAX) + 1]).unwrap();
        assert!(seq.commit().is_err());
    }

    #[test]
    fn seconds_input_rescales() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        assert!(seq.set_timestamps_sec(&[1.0]).is_err());
        seq.set_time_scale(125e6).unwrap();
        seq.set_timestamps_sec(&[1.0, 2.0]).unwrap();
        seq.set_event_codes(&[1, 2]).unwrap();
        seq.commit().unwrap();
        let slot = mgr.load(seq.id()).unwrap();
        assert_eq!(_sim.seq_ram_row(slot, 0), (1, 125_000_000));
        assert_eq!(_sim.seq_ram_row(slot, 1), (2, 250_000_000));
    }

    #[test]
    fn trigger_source_validation() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        for ok in [0, 7, 16, 18] {
            seq.set_trig_src(ok).unwrap();
        }
        for bad in [8, 15, 19, 100] {
            assert!(seq.set_trig_src(bad).is_err());
        }
    }

    #[test]
    fn load_needs_commit_and_free_slot() {
        let (_sim, mgr) = mgr();
        let a = mgr.create();
        assert!(matches!(
            mgr.load(a.id()),
            Err(MrfError::SequenceState { op: "load", .. })
        ));

        for seq in [&a, &mgr.create()] {
            seq.set_event_codes(&[1]).unwrap();
            seq.set_timestamps_ticks(&[10]).unwrap();
            seq.commit().unwrap();
            mgr.load(seq.id()).unwrap();
        }
        assert_eq!(mgr.bound_count(), 2);

        let c = mgr.create();
        c.set_event_codes(&[1]).unwrap();
        c.set_timestamps_ticks(&[10]).unwrap();
        c.commit().unwrap();
        assert!(matches!(mgr.load(c.id()), Err(MrfError::NoFreeRam)));
    }

    #[test]
    fn load_unload_round_trip_keeps_bindings_balanced() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        seq.set_event_codes(&[5]).unwrap();
        seq.set_timestamps_ticks(&[1]).unwrap();
        seq.commit().unwrap();

        let before = mgr.bound_count();
        let slot = mgr.load(seq.id()).unwrap();
        assert_eq!(mgr.slot_owner(slot), Some(seq.id()));
        mgr.unload(seq.id()).unwrap();
        seq.commit().unwrap();
        assert_eq!(mgr.bound_count(), before);
        assert_eq!(seq.state(), SeqState::Committed);
    }

    #[test]
    fn enable_requires_loaded_and_blocks_reload() {
        let (_sim, mgr) = mgr();
        let seq = mgr.create();
        seq.set_event_codes(&[1]).unwrap();
        seq.set_timestamps_ticks(&[10]).unwrap();
        seq.commit().unwrap();
        assert!(mgr.enable(seq.id()).is_err());

        let slot = mgr.load(seq.id()).unwrap();
        mgr.enable(seq.id()).unwrap();
        assert_eq!(seq.state(), SeqState::Running(slot));
        // Unloading or re-loading while armed is rejected.
        assert!(mgr.unload(seq.id()).is_err());
        assert!(matches!(
            mgr.load(seq.id()),
            Err(MrfError::SequenceState { op: "load", .. })
        ));

        mgr.disable(seq.id()).unwrap();
        assert_eq!(seq.state(), SeqState::Loaded(slot));
        mgr.unload(seq.id()).unwrap();
    }

    #[test]
    fn stop_sync_rewrites_divergent_ram() {
        let (sim, mgr) = mgr();
        let seq = mgr.create();
        seq.set_event_codes(&[1, 2]).unwrap();
        seq.set_timestamps_ticks(&[10, 20]).unwrap();
        seq.commit().unwrap();
        let slot = mgr.load(seq.id()).unwrap();
        mgr.enable(seq.id()).unwrap();

        // Re-commit different rows while armed, then let the hardware stop.
        seq.set_timestamps_ticks(&[10, 30]).unwrap();
        seq.commit().unwrap();
        assert!(seq.needs_sync());
        sim.complete_sequence(slot);

        let id = mgr.update(slot).expect("slot bound");
        mgr.finish_update(id);
        assert!(!seq.needs_sync());
        assert_eq!(seq.state(), SeqState::Loaded(slot));
        assert_eq!(sim.seq_ram_row(slot, 1), (2, 30));
        assert_eq!(sim.seq_ram_row(slot, 2), (EVENT_SEQ_END, 31));
    }
}
