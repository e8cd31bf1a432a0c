//! Event generator card.

mod dbus;
mod fpio;
mod mxc;
mod seq;
mod softevt;
mod trigevt;

pub use dbus::{Dbus, DbusSrc};
pub use fpio::{FpInput, FpOutput};
pub use mxc::Mxc;
pub use seq::{SeqMgr, SeqRunMode, SeqState, SoftSeq};
pub use softevt::SoftEvt;
pub use trigevt::TrigEvt;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Sender};

use mrf_chip::evg::{self, clock_source, control, irq, NUM_SEQ_RAM};
use mrf_chip::evr::fw;
use mrf_chip::{fracsynth, FRAC_SYNTH_REF_MHZ};

use crate::dbuf::DataBufTx;
use crate::error::{MrfError, Result};
use crate::io::{RegIo, RegWindow};
use crate::work::{CallbackEngine, Priority, Scan};

/// Event-clock source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvgClockSource {
    /// The on-card fractional synthesizer.
    Internal,
    /// External RF divided by the given factor (1..=32).
    ExternalRf(u8),
}

enum SyncMsg {
    Stop(usize),
    Quit,
}

/// Per-cause scan points.
#[derive(Debug)]
pub struct EvgScans {
    /// Data-buffer transmission completed.
    pub(crate) buffer_ready: Arc<Scan>,
    /// External (front-panel) interrupt.
    pub(crate) ext_irq: Arc<Scan>,
}

/// ISR cause counters.
#[derive(Debug, Default)]
pub struct EvgCounters {
    pub(crate) rx_violation: AtomicU32,
    pub(crate) seq_start: AtomicU32,
    pub(crate) seq_stop: AtomicU32,
    pub(crate) ext_irq: AtomicU32,
}

/// Construction options.
#[derive(Debug, Clone)]
pub struct EvgConfig {
    /// Spawn the callback and sequence-update threads. Tests turn this
    /// off and pump by hand.
    pub threaded: bool,
}

impl Default for EvgConfig {
    fn default() -> Self {
        Self { threaded: true }
    }
}

struct ClockState {
    source: EvgClockSource,
    speed_mhz: f64,
}

/// An event generator: register window, sub-units, sequence engine and
/// the update worker that reconciles stopped sequence RAMs.
pub struct Evg {
    id: u32,
    win: RegWindow,
    engine: Arc<CallbackEngine>,

    trig_evts: Vec<TrigEvt>,
    mxcs: Vec<Mxc>,
    dbus: Vec<Dbus>,
    fp_inputs: Vec<FpInput>,
    fp_outputs: Vec<FpOutput>,
    soft_evt: SoftEvt,

    seq_mgr: Arc<SeqMgr>,
    buf_tx: DataBufTx,

    scans: EvgScans,
    counters: EvgCounters,
    clock: Mutex<ClockState>,

    sync_tx: Sender<SyncMsg>,
    sync_rx: crossbeam_channel::Receiver<SyncMsg>,
    sync_stop: Arc<AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Evg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evg").field("id", &self.id).finish()
    }
}

impl Evg {
    /// Bring up a generator over `io`.
    ///
    /// # Errors
    ///
    /// [`MrfError::BadDevice`] when the window does not answer like an EVG.
    pub fn new(id: u32, io: Arc<dyn RegIo>, cfg: &EvgConfig) -> Result<Arc<Self>> {
        let win = RegWindow::new(io);

        let version = win.read32(evg::FW_VERSION);
        if (version & fw::TYPE_MASK) >> fw::TYPE_SHIFT != fw::TYPE_EVG {
            return Err(MrfError::bad_device(format!(
                "firmware signature {version:#010x} is not an EVG"
            )));
        }
        if version & fw::VER_MASK < fw::MIN_VERSION {
            return Err(MrfError::bad_device(format!(
                "EVG firmware revision {} too old (need {})",
                version & fw::VER_MASK,
                fw::MIN_VERSION
            )));
        }
        tracing::info!(id, version = version & fw::VER_MASK, "EVG signature accepted");

        let engine = if cfg.threaded {
            CallbackEngine::spawn()
        } else {
            CallbackEngine::manual()
        };

        let (sync_tx, sync_rx) = bounded(2 * NUM_SEQ_RAM);
        let sync_stop = Arc::new(AtomicBool::new(false));

        let card = Arc::new(Self {
            id,
            win: win.clone(),
            engine: Arc::clone(&engine),
            trig_evts: (0..evg::NUM_TRIG_EVT).map(|i| TrigEvt::new(win.clone(), i)).collect(),
            mxcs: (0..evg::NUM_MXC).map(|i| Mxc::new(win.clone(), i)).collect(),
            dbus: (0..evg::NUM_DBUS_BIT).map(|i| Dbus::new(win.clone(), i)).collect(),
            fp_inputs: (0..evg::NUM_FP_INPUT).map(|i| FpInput::new(win.clone(), i)).collect(),
            fp_outputs: (0..evg::NUM_FP_OUTPUT)
                .map(|i| FpOutput::new(win.clone(), i))
                .collect(),
            soft_evt: SoftEvt::new(win.clone()),
            seq_mgr: SeqMgr::new(win.clone()),
            buf_tx: DataBufTx::new(win, evg::DATA_TX_BASE, evg::DATA_BUF_CTRL, 0),
            scans: EvgScans {
                buffer_ready: Scan::new(),
                ext_irq: Scan::new(),
            },
            counters: EvgCounters::default(),
            clock: Mutex::new(ClockState {
                source: EvgClockSource::Internal,
                speed_mhz: 0.0,
            }),
            sync_tx,
            sync_rx,
            sync_stop: Arc::clone(&sync_stop),
            threads: Mutex::new(Vec::new()),
        });

        if cfg.threaded {
            let mgr = Arc::clone(&card.seq_mgr);
            let engine = Arc::clone(&card.engine);
            let rx = card.sync_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("mrf-evg{id}-seq"))
                .spawn(move || {
                    while let Ok(msg) = rx.recv() {
                        let slot = match msg {
                            SyncMsg::Stop(slot) => slot,
                            SyncMsg::Quit => break,
                        };
                        if sync_stop.load(Ordering::Acquire) {
                            break;
                        }
                        if let Some(seq_id) = mgr.update(slot) {
                            let mgr = Arc::clone(&mgr);
                            engine.request(
                                Priority::High,
                                Box::new(move || mgr.finish_update(seq_id)),
                            );
                        }
                    }
                })
                .expect("spawn sequence update thread");
            card.threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }

        Ok(card)
    }

    /// Card id in the process registry.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The card's register window.
    #[must_use]
    pub fn window(&self) -> &RegWindow {
        &self.win
    }

    /// The deferred-work engine (tests pump it manually).
    #[must_use]
    pub fn engine(&self) -> &Arc<CallbackEngine> {
        &self.engine
    }

    /// The sequence engine.
    #[must_use]
    pub fn seq_mgr(&self) -> &Arc<SeqMgr> {
        &self.seq_mgr
    }

    /// Transmit side of the data buffer.
    #[must_use]
    pub fn buf_tx(&self) -> &DataBufTx {
        &self.buf_tx
    }

    /// The software-event port.
    #[must_use]
    pub fn soft_evt(&self) -> &SoftEvt {
        &self.soft_evt
    }

    /// Per-cause scan points.
    #[must_use]
    pub fn scans(&self) -> &EvgScans {
        &self.scans
    }

    // ── Sub-unit access ─────────────────────────────────────────────────

    /// Event trigger `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn trig_evt(&self, i: usize) -> Result<&TrigEvt> {
        self.trig_evts
            .get(i)
            .ok_or_else(|| MrfError::range("trigger id", i as u64, self.trig_evts.len() as u64))
    }

    /// Multiplexed counter `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn mxc(&self, i: usize) -> Result<&Mxc> {
        self.mxcs
            .get(i)
            .ok_or_else(|| MrfError::range("mux counter id", i as u64, self.mxcs.len() as u64))
    }

    /// Distributed-bus bit `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn dbus_bit(&self, i: usize) -> Result<&Dbus> {
        self.dbus
            .get(i)
            .ok_or_else(|| MrfError::range("dbus bit", i as u64, self.dbus.len() as u64))
    }

    /// Front-panel input `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn fp_input(&self, i: usize) -> Result<&FpInput> {
        self.fp_inputs
            .get(i)
            .ok_or_else(|| MrfError::range("input id", i as u64, self.fp_inputs.len() as u64))
    }

    /// Front-panel output `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn fp_output(&self, i: usize) -> Result<&FpOutput> {
        self.fp_outputs
            .get(i)
            .ok_or_else(|| MrfError::range("output id", i as u64, self.fp_outputs.len() as u64))
    }

    // ── Card-level controls ─────────────────────────────────────────────

    /// Whether event generation is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.win.read32(evg::CONTROL) & control::ENABLE != 0
    }

    /// Enable or disable event generation.
    pub fn enable(&self, ena: bool) {
        if ena {
            self.win.bit_set32(evg::CONTROL, control::ENABLE);
        } else {
            self.win.bit_clr32(evg::CONTROL, control::ENABLE);
        }
    }

    /// Turn the card's interrupt delivery on or off: every cause the
    /// dispatcher handles plus the master enable.
    pub fn irq_enable(&self, ena: bool) {
        let causes = irq::MASTER
            | irq::RXVIO
            | irq::FIFOFULL
            | irq::BUFFULL
            | irq::EXT_IRQ
            | irq::seq_start(0)
            | irq::seq_start(1)
            | irq::seq_stop(0)
            | irq::seq_stop(1);
        if ena {
            self.win.bit_set32(evg::IRQ_ENABLE, causes);
        } else {
            self.win.bit_clr32(evg::IRQ_ENABLE, causes);
        }
    }

    /// Select the event-clock source.
    ///
    /// # Errors
    ///
    /// External RF division must be 1..=32.
    pub fn set_clock_source(&self, src: EvgClockSource) -> Result<()> {
        match src {
            EvgClockSource::Internal => {
                let speed = {
                    let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
                    clock.source = src;
                    clock.speed_mhz
                };
                let _irq = self.win.lock_irq();
                let v = self.win.read8(evg::CLOCK_SOURCE);
                self.win.write8(evg::CLOCK_SOURCE, v & !clock_source::EXTRF);
                drop(_irq);
                if speed > 0.0 {
                    self.set_clock_speed(speed)?;
                }
            }
            EvgClockSource::ExternalRf(div) => {
                if div == 0 || div > 32 {
                    return Err(MrfError::range("RF divider", div, 32u32));
                }
                let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
                clock.source = src;
                drop(clock);
                let _irq = self.win.lock_irq();
                let v = self.win.read8(evg::CLOCK_SOURCE);
                self.win.write8(evg::CLOCK_SOURCE, v | clock_source::EXTRF);
                self.win.write8(evg::RF_DIV, div - 1);
            }
        }
        Ok(())
    }

    /// Currently selected clock source.
    #[must_use]
    pub fn clock_source(&self) -> EvgClockSource {
        if self.win.read8(evg::CLOCK_SOURCE) & clock_source::EXTRF != 0 {
            EvgClockSource::ExternalRf(self.win.read8(evg::RF_DIV) + 1)
        } else {
            EvgClockSource::Internal
        }
    }

    /// Program the event-clock speed in MHz.
    ///
    /// With the internal source this writes the synthesizer, skipping the
    /// write when the control word is unchanged; with an external source
    /// the value is only recorded for reporting.
    ///
    /// # Errors
    ///
    /// The synthesizer must reach the frequency within 100 ppm.
    pub fn set_clock_speed(&self, speed_mhz: f64) -> Result<()> {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        if clock.source == EvgClockSource::Internal {
            let (word, err_ppm) = fracsynth::control_word(speed_mhz, FRAC_SYNTH_REF_MHZ, 0);
            if word == 0 || err_ppm > 100.0 {
                return Err(MrfError::range("event clock MHz", speed_mhz as u64, 160u64));
            }
            if word != self.win.read32(evg::FRAC_SYNTH_WORD) {
                self.win.write32(evg::FRAC_SYNTH_WORD, word);
                self.win.write16(evg::USEC_DIV, speed_mhz as u16);
            }
        }
        clock.speed_mhz = speed_mhz;
        Ok(())
    }

    /// Configured event-clock speed in MHz.
    #[must_use]
    pub fn clock_speed(&self) -> f64 {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .speed_mhz
    }

    // ── Interrupt plumbing ──────────────────────────────────────────────

    /// Top-half entry: classify causes, queue sequence syncs, acknowledge
    /// with a write-one-to-clear and force the write with a trailing read.
    pub fn isr(&self) -> bool {
        let flags = self.win.read32(evg::IRQ_FLAG);
        let enable = self.win.read32(evg::IRQ_ENABLE);
        let active = flags & enable;
        if active == 0 {
            return false;
        }

        if active & irq::EXT_IRQ != 0 {
            self.counters.ext_irq.fetch_add(1, Ordering::Relaxed);
            self.scans.ext_irq.request();
        }
        if active & irq::RXVIO != 0 {
            self.counters.rx_violation.fetch_add(1, Ordering::Relaxed);
        }
        if active & irq::BUFFULL != 0 {
            self.scans.buffer_ready.request();
        }
        for slot in 0..NUM_SEQ_RAM {
            if active & irq::seq_start(slot) != 0 {
                self.counters.seq_start.fetch_add(1, Ordering::Relaxed);
            }
            if active & irq::seq_stop(slot) != 0 {
                self.counters.seq_stop.fetch_add(1, Ordering::Relaxed);
                // Full queue means a sync for this slot is already pending.
                let _ = self.sync_tx.try_send(SyncMsg::Stop(slot));
            }
        }

        let _irq = self.win.lock_irq();
        self.win.write32(evg::IRQ_FLAG, flags);
        let _ = self.win.read32(evg::IRQ_FLAG);
        true
    }

    /// Manual mode: run queued sequence syncs synchronously (update leg
    /// inline, finish leg through the high-priority queue).
    pub fn pump_syncs(&self) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.sync_rx.try_recv() {
            if let SyncMsg::Stop(slot) = msg {
                if let Some(seq_id) = self.seq_mgr.update(slot) {
                    let mgr = Arc::clone(&self.seq_mgr);
                    self.engine.request(
                        Priority::High,
                        Box::new(move || mgr.finish_update(seq_id)),
                    );
                }
                n += 1;
            }
        }
        n
    }

    /// Sequence-stop interrupt count.
    #[must_use]
    pub fn count_seq_stop(&self) -> u32 {
        self.counters.seq_stop.load(Ordering::Relaxed)
    }

    /// Upstream receiver-violation count.
    #[must_use]
    pub fn count_rx_violation(&self) -> u32 {
        self.counters.rx_violation.load(Ordering::Relaxed)
    }

    /// Sequence-start interrupt count.
    #[must_use]
    pub fn count_seq_start(&self) -> u32 {
        self.counters.seq_start.load(Ordering::Relaxed)
    }

    /// External-input interrupt count.
    #[must_use]
    pub fn count_ext_irq(&self) -> u32 {
        self.counters.ext_irq.load(Ordering::Relaxed)
    }
}

impl Drop for Evg {
    fn drop(&mut self) {
        self.sync_stop.store(true, Ordering::Release);
        let _ = self.sync_tx.try_send(SyncMsg::Quit);
        let threads: Vec<_> = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for t in threads {
            let _ = t.join();
        }
        self.engine.shutdown();
        tracing::info!(id = self.id, "EVG torn down");
    }
}
