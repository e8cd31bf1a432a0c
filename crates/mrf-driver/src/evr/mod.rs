//! Event receiver card.

mod cml;
mod event;
mod input;
mod isr;
mod output;
mod prescaler;
mod pulser;
mod subunit;
mod time;

pub use cml::{CmlMode, CmlOutput};
pub use event::{DrainMsg, EventCallback, EventTable, FifoEvent};
pub use input::Input;
pub use output::{OutputKind, OutputMux};
pub use prescaler::Prescaler;
pub use pulser::Pulser;
pub use subunit::SubUnit;
pub use time::{TimeEngine, Timestamp};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use mrf_chip::evr::{self, clk_ctrl, control, fw, status};
use mrf_chip::{fracsynth, EVENT_TS_COUNTER_RST, FRAC_SYNTH_REF_MHZ};

use crate::dbuf::{DataBufRx, DataBufTx};
use crate::error::{MrfError, Result};
use crate::io::{RegIo, RegWindow};
use crate::work::{CallbackEngine, Priority, Scan};

/// Timestamp tick source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsSource {
    /// Divide the event clock down with the timestamp prescaler.
    Internal,
    /// Count timestamp events from the link.
    Event,
    /// Clock off distributed-bus bit 4.
    DBus4,
}

/// Notification kinds exposed to the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// A data-buffer frame finished arriving.
    BufferReady,
    /// A hardware-mapped action fired.
    MappedEvent,
    /// Heartbeat timeout.
    Heartbeat,
    /// Receiver error (link state).
    RxError,
    /// Event FIFO overflowed.
    FifoFull,
    /// The timestamp engine changed validity.
    TimestampValidChange,
    /// A specific event code was drained from the FIFO.
    EventOccurred(u8),
}

/// Per-cause scan points, fanned out by the ISR.
#[derive(Debug)]
pub struct EvrScans {
    pub(crate) buffer_ready: Arc<Scan>,
    pub(crate) mapped_event: Arc<Scan>,
    pub(crate) heartbeat: Arc<Scan>,
    pub(crate) rx_error: Arc<Scan>,
    pub(crate) fifo_full: Arc<Scan>,
}

/// ISR cause counters. Plain relaxed counters, raced benignly.
#[derive(Debug, Default)]
pub struct EvrCounters {
    pub(crate) recv_error: AtomicU32,
    pub(crate) hardware_irq: AtomicU32,
    pub(crate) heartbeat: AtomicU32,
}

/// Construction options.
#[derive(Debug, Clone)]
pub struct EvrConfig {
    /// Spawn the drain and callback threads. Tests turn this off and pump
    /// the queues by hand.
    pub threaded: bool,
    /// Minimum period between FIFO drain passes; zero disables the
    /// throttle. Default 1/2000 s.
    pub fifo_min_period: Duration,
    /// Data-buffer protocol filter; 0 accepts any id.
    pub rx_protocol: u32,
}

impl Default for EvrConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            fifo_min_period: Duration::from_micros(500),
            rx_protocol: 0,
        }
    }
}

/// An event receiver: register window, sub-units, event table, timestamp
/// engine, data buffers, and the workers that service them.
pub struct Evr {
    id: u32,
    win: RegWindow,
    engine: Arc<CallbackEngine>,
    events: Arc<EventTable>,
    time: Arc<TimeEngine>,

    pulsers: Vec<Pulser>,
    prescalers: Vec<Prescaler>,
    outputs: HashMap<(OutputKind, usize), OutputMux>,
    inputs: Vec<Input>,
    cmls: Vec<CmlOutput>,

    buf_rx: Arc<DataBufRx>,
    buf_tx: DataBufTx,

    scans: EvrScans,
    counters: EvrCounters,

    drain_tx: Sender<DrainMsg>,
    drain_stop: Arc<std::sync::atomic::AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,

    /// Self-reference for work queued on the card's behalf (link poll);
    /// queued items must not keep a torn-down card alive.
    weak: std::sync::Weak<Evr>,

    /// Keeps the internal seconds-tick subscription removable.
    seconds_cb: EventCallback,
}

impl std::fmt::Debug for Evr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evr").field("id", &self.id).finish()
    }
}

impl Evr {
    /// Bring up a receiver over `io`.
    ///
    /// Validates the firmware signature and builds every sub-unit; either
    /// succeeds fully or leaves no partial state behind.
    ///
    /// # Errors
    ///
    /// [`MrfError::BadDevice`] when the window does not answer like an EVR.
    pub fn new(id: u32, io: Arc<dyn RegIo>, cfg: &EvrConfig) -> Result<Arc<Self>> {
        let win = RegWindow::new(io);

        let version = win.read32(evr::FW_VERSION);
        if (version & fw::TYPE_MASK) >> fw::TYPE_SHIFT != fw::TYPE_EVR {
            return Err(MrfError::bad_device(format!(
                "firmware signature {version:#010x} is not an EVR"
            )));
        }
        if version & fw::VER_MASK < fw::MIN_VERSION {
            return Err(MrfError::bad_device(format!(
                "EVR firmware revision {} too old (need {})",
                version & fw::VER_MASK,
                fw::MIN_VERSION
            )));
        }
        let form = (version & fw::FORM_MASK) >> fw::FORM_SHIFT;

        // Sub-unit population per form factor.
        let (n_fp, n_univ, n_rb, n_cml, n_inp) = match form {
            evr::form::CPCI => (0, 0, 0, 0, 0),
            evr::form::PMC => (3, 0, 0, 0, 1),
            evr::form::VME64 => (7, 4, 16, 3, 2),
            other => {
                tracing::warn!(form = other, "unknown EVR form factor, minimal sub-units");
                (0, 0, 0, 0, 0)
            }
        };
        tracing::info!(
            id,
            form,
            version = version & fw::VER_MASK,
            "EVR signature accepted"
        );

        let engine = if cfg.threaded {
            CallbackEngine::spawn()
        } else {
            CallbackEngine::manual()
        };

        let events = EventTable::new(win.clone(), Arc::clone(&engine), cfg.fifo_min_period);
        let time = TimeEngine::new(win.clone());

        // The timestamp engine holds permanent interest in the seconds tick.
        let seconds_cb: EventCallback = {
            let time = Arc::clone(&time);
            Arc::new(move |_ev| time.on_seconds_tick())
        };
        events.subscribe(EVENT_TS_COUNTER_RST, Arc::clone(&seconds_cb))?;

        let mut outputs = HashMap::new();
        outputs.insert(
            (OutputKind::Interrupt, 0),
            OutputMux::new(win.clone(), evr::IRQ_PULSE_MAP),
        );
        for i in 0..n_fp {
            outputs.insert(
                (OutputKind::FrontPanel, i),
                OutputMux::new(win.clone(), evr::output_map_fp(i)),
            );
        }
        for i in 0..n_univ {
            outputs.insert(
                (OutputKind::Universal, i),
                OutputMux::new(win.clone(), evr::output_map_fpuniv(i)),
            );
        }
        for i in 0..n_rb {
            outputs.insert(
                (OutputKind::Transition, i),
                OutputMux::new(win.clone(), evr::output_map_rb(i)),
            );
        }

        let buf_rx = Arc::new(DataBufRx::new(
            win.clone(),
            evr::DATA_RX_BASE,
            evr::DATA_BUF_CTRL,
            evr::IRQ_ENABLE,
            evr::irq::BUFFULL,
            cfg.rx_protocol,
        ));
        let buf_tx = DataBufTx::new(win.clone(), evr::DATA_TX_BASE, evr::DATA_TX_CTRL, 0);

        let (drain_tx, drain_rx) = bounded(event::DRAIN_MAILBOX_DEPTH);
        let drain_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let pulsers = (0..10).map(|i| Pulser::new(win.clone(), i)).collect();
        let prescalers = (0..3).map(|i| Prescaler::new(win.clone(), i)).collect();
        let inputs = (0..n_inp).map(|i| Input::new(win.clone(), i)).collect();
        let cmls = (0..n_cml).map(|i| CmlOutput::new(win.clone(), i)).collect();

        let card = Arc::new_cyclic(|weak| Self {
            id,
            win,
            engine,
            events: Arc::clone(&events),
            time,
            pulsers,
            prescalers,
            outputs,
            inputs,
            cmls,
            buf_rx,
            buf_tx,
            scans: EvrScans {
                buffer_ready: Scan::new(),
                mapped_event: Scan::new(),
                heartbeat: Scan::new(),
                rx_error: Scan::new(),
                fifo_full: Scan::new(),
            },
            counters: EvrCounters::default(),
            drain_tx,
            drain_stop: Arc::clone(&drain_stop),
            threads: Mutex::new(Vec::new()),
            weak: weak.clone(),
            seconds_cb,
        });

        if cfg.threaded {
            let table = Arc::clone(&card.events);
            let handle = std::thread::Builder::new()
                .name(format!("mrf-evr{id}-drain"))
                .spawn(move || {
                    while let Ok(msg) = drain_rx.recv() {
                        if msg == DrainMsg::Stop
                            || drain_stop.load(std::sync::atomic::Ordering::Acquire)
                        {
                            break;
                        }
                        table.drain_fifo_pass();
                    }
                })
                .expect("spawn FIFO drain thread");
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

    /// The event-action table.
    #[must_use]
    pub fn events(&self) -> &Arc<EventTable> {
        &self.events
    }

    /// The timestamp engine.
    #[must_use]
    pub fn time(&self) -> &Arc<TimeEngine> {
        &self.time
    }

    /// Receive side of the data buffer.
    #[must_use]
    pub fn buf_rx(&self) -> &Arc<DataBufRx> {
        &self.buf_rx
    }

    /// Transmit side of the data buffer.
    #[must_use]
    pub fn buf_tx(&self) -> &DataBufTx {
        &self.buf_tx
    }

    /// Per-cause scan points.
    #[must_use]
    pub fn scans(&self) -> &EvrScans {
        &self.scans
    }

    /// ISR cause counters.
    #[must_use]
    pub fn counters(&self) -> &EvrCounters {
        &self.counters
    }

    // ── Sub-unit access ─────────────────────────────────────────────────

    /// Pulser `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn pulser(&self, i: usize) -> Result<&Pulser> {
        self.pulsers
            .get(i)
            .ok_or_else(|| MrfError::range("pulser id", i as u64, self.pulsers.len() as u64))
    }

    /// Prescaler `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn prescaler(&self, i: usize) -> Result<&Prescaler> {
        self.prescalers
            .get(i)
            .ok_or_else(|| MrfError::range("prescaler id", i as u64, self.prescalers.len() as u64))
    }

    /// Output `(kind, i)`, if this form factor has it.
    #[must_use]
    pub fn output(&self, kind: OutputKind, i: usize) -> Option<&OutputMux> {
        self.outputs.get(&(kind, i))
    }

    /// Input `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn input(&self, i: usize) -> Result<&Input> {
        self.inputs
            .get(i)
            .ok_or_else(|| MrfError::range("input id", i as u64, self.inputs.len() as u64))
    }

    /// CML output `i`.
    ///
    /// # Errors
    ///
    /// Unknown ids are a range error.
    pub fn cml(&self, i: usize) -> Result<&CmlOutput> {
        self.cmls
            .get(i)
            .ok_or_else(|| MrfError::range("CML id", i as u64, self.cmls.len() as u64))
    }

    // ── Card-level controls ─────────────────────────────────────────────

    /// Whether event reception is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.win.read32(evr::CONTROL) & control::ENABLE != 0
    }

    /// Enable or disable reception and the mapping RAM together.
    pub fn enable(&self, ena: bool) {
        if ena {
            self.win
                .bit_set32(evr::CONTROL, control::ENABLE | control::MAPENA);
        } else {
            self.win
                .bit_clr32(evr::CONTROL, control::ENABLE | control::MAPENA);
        }
    }

    /// Turn the card's interrupt delivery on or off: every cause the
    /// dispatcher handles plus the master enable.
    pub fn irq_enable(&self, ena: bool) {
        use mrf_chip::evr::irq;
        let causes = irq::MASTER
            | irq::RXERR
            | irq::FIFOFULL
            | irq::HEARTBEAT
            | irq::EVENT
            | irq::HWMAPPED
            | irq::BUFFULL;
        if ena {
            self.win.bit_set32(evr::IRQ_ENABLE, causes);
        } else {
            self.win.bit_clr32(evr::IRQ_ENABLE, causes);
        }
    }

    /// Event clock in MHz, recovered from the synthesizer word.
    #[must_use]
    pub fn clock(&self) -> f64 {
        fracsynth::analyze(self.win.read32(evr::FRAC_DIV), FRAC_SYNTH_REF_MHZ)
    }

    /// Program the event clock.
    ///
    /// Skips the synthesizer write when the control word is unchanged
    /// (reprogramming glitches the output); the microsecond divider is
    /// kept in lock-step.
    ///
    /// # Errors
    ///
    /// Unsynthesizable frequencies are a range error.
    pub fn clock_set(&self, freq_mhz: f64) -> Result<()> {
        let (word, err_ppm) = fracsynth::control_word(freq_mhz, FRAC_SYNTH_REF_MHZ, 0);
        if word == 0 || err_ppm > 100.0 {
            return Err(MrfError::range("event clock MHz", freq_mhz as u64, 160u64));
        }

        if word != self.win.read32(evr::FRAC_DIV) {
            self.win.write32(evr::FRAC_DIV, word);
        }

        let old_udiv = self.win.read32(evr::USEC_DIV) as u16;
        let new_udiv = freq_mhz as u16;
        if new_udiv != old_udiv {
            self.win.write32(evr::USEC_DIV, u32::from(new_udiv));
        }
        Ok(())
    }

    /// Microsecond divider readback.
    #[must_use]
    pub fn usec_div(&self) -> u32 {
        self.win.read32(evr::USEC_DIV)
    }

    /// Whether the event-clock PLL is locked.
    #[must_use]
    pub fn pll_locked(&self) -> bool {
        self.win.read32(evr::CLK_CTRL) & clk_ctrl::CGLOCK != 0
    }

    /// Whether the optical link is up.
    #[must_use]
    pub fn link_ok(&self) -> bool {
        self.win.read32(evr::STATUS) & status::LEGVIO == 0
    }

    /// Live distributed-bus sample.
    #[must_use]
    pub fn dbus(&self) -> u8 {
        ((self.win.read32(evr::STATUS) & status::DBUS_MASK) >> status::DBUS_SHIFT) as u8
    }

    // ── Timestamp configuration ─────────────────────────────────────────

    /// Select where timestamp ticks come from.
    ///
    /// # Errors
    ///
    /// `Internal` needs a configured, positive timestamp clock.
    pub fn set_ts_source(&self, src: TsSource) -> Result<()> {
        let ts_hz = self.time.clock_hz();
        match src {
            TsSource::Internal => {
                if ts_hz <= 0.0 || !ts_hz.is_finite() {
                    return Err(MrfError::range("timestamp clock Hz", 0u32, 0u32));
                }
                let div = (self.clock() * 1e6 / ts_hz) as u16;
                self.win.bit_clr32(evr::CONTROL, control::TSDBUS);
                self.win.write32(evr::COUNTER_PS, u32::from(div));
            }
            TsSource::Event => {
                self.win.bit_clr32(evr::CONTROL, control::TSDBUS);
                self.win.write32(evr::COUNTER_PS, 0);
            }
            TsSource::DBus4 => {
                self.win.bit_set32(evr::CONTROL, control::TSDBUS);
                self.win.write32(evr::COUNTER_PS, 0);
            }
        }
        Ok(())
    }

    /// Current timestamp tick source.
    #[must_use]
    pub fn ts_source(&self) -> TsSource {
        if self.win.read32(evr::COUNTER_PS) != 0 {
            TsSource::Internal
        } else if self.win.read32(evr::CONTROL) & control::TSDBUS != 0 {
            TsSource::DBus4
        } else {
            TsSource::Event
        }
    }

    /// Configure the timestamp tick rate in Hz.
    ///
    /// # Errors
    ///
    /// Must be finite and positive.
    pub fn clock_ts_set(&self, hz: f64) -> Result<()> {
        if hz <= 0.0 || !hz.is_finite() {
            return Err(MrfError::range("timestamp clock Hz", 0u32, 0u32));
        }
        if self.ts_source() == TsSource::Internal {
            let div = (self.clock() * 1e6 / hz) as u16;
            self.win.write32(evr::COUNTER_PS, u32::from(div));
        }
        self.time.set_clock_hz(hz);
        Ok(())
    }

    /// Timestamp tick rate in Hz.
    #[must_use]
    pub fn clock_ts(&self) -> f64 {
        if self.ts_source() == TsSource::Internal {
            let div = self.win.read32(evr::COUNTER_PS);
            if div == 0 {
                return 0.0;
            }
            self.clock() * 1e6 / f64::from(div)
        } else {
            self.time.clock_hz()
        }
    }

    /// Resolve a timestamp; see [`TimeEngine::get_time`].
    ///
    /// # Errors
    ///
    /// Fails while timestamp validity is down.
    pub fn get_timestamp(&self, event: u32) -> Result<Timestamp> {
        self.time.get_time(event, &self.events)
    }

    /// Live tick counter, unlatched.
    #[must_use]
    pub fn ticks(&self) -> u32 {
        self.win.read32(evr::TS_EVT)
    }

    // ── Subscription surface ────────────────────────────────────────────

    /// Subscribe `cb` to event `code`.
    ///
    /// # Errors
    ///
    /// Code 0 carries no events; duplicates of the FIFO-save mapping fail.
    pub fn subscribe_event(&self, code: u8, cb: EventCallback) -> Result<()> {
        self.events.subscribe(code, cb)
    }

    /// Remove a subscription added by [`Evr::subscribe_event`].
    ///
    /// # Errors
    ///
    /// Fails when `cb` is not subscribed to `code`.
    pub fn unsubscribe_event(&self, code: u8, cb: &EventCallback) -> Result<()> {
        self.events.unsubscribe(code, cb)
    }

    /// Scan point for `kind`.
    #[must_use]
    pub fn scan_io(&self, kind: ScanKind) -> Arc<Scan> {
        match kind {
            ScanKind::BufferReady => Arc::clone(&self.scans.buffer_ready),
            ScanKind::MappedEvent => Arc::clone(&self.scans.mapped_event),
            ScanKind::Heartbeat => Arc::clone(&self.scans.heartbeat),
            ScanKind::RxError => Arc::clone(&self.scans.rx_error),
            ScanKind::FifoFull => Arc::clone(&self.scans.fifo_full),
            ScanKind::TimestampValidChange => Arc::clone(self.time.scan_valid_change()),
            ScanKind::EventOccurred(code) => Arc::clone(self.events.occurred(code)),
        }
    }

    // ── Interrupt plumbing ──────────────────────────────────────────────

    /// Top-half entry; see [`isr::isr`].
    pub fn isr(&self) -> bool {
        isr::isr(self)
    }

    pub(crate) fn wake_drain(&self, msg: DrainMsg) {
        // Full mailbox means a wake is already pending.
        let _ = self.drain_tx.try_send(msg);
    }

    pub(crate) fn schedule_poll_link(&self, delay: Duration) {
        let weak = self.weak.clone();
        self.engine.request_delayed(
            delay,
            Priority::Medium,
            Box::new(move || {
                if let Some(evr) = weak.upgrade() {
                    evr.poll_link();
                }
            }),
        );
    }

    /// Link poll: while the receiver error persists, keep timestamps
    /// invalid and come back in 100 ms; on recovery re-enable the cause.
    pub fn poll_link(&self) {
        let flags = self.win.read32(evr::IRQ_FLAG);
        if flags & evr::irq::RXERR != 0 {
            self.time.link_down_tick();
            self.win.write32(evr::IRQ_FLAG, evr::irq::RXERR);
            self.schedule_poll_link(Duration::from_millis(100));
        } else {
            self.scans.rx_error.request();
            self.win.bit_set32(evr::IRQ_ENABLE, evr::irq::RXERR);
        }
    }

    /// Counter accessors for the record layer.
    #[must_use]
    pub fn count_recv_error(&self) -> u32 {
        self.counters.recv_error.load(Ordering::Relaxed)
    }

    /// Hardware-mapped interrupt count.
    #[must_use]
    pub fn count_hardware_irq(&self) -> u32 {
        self.counters.hardware_irq.load(Ordering::Relaxed)
    }

    /// Heartbeat timeout count.
    #[must_use]
    pub fn count_heartbeat(&self) -> u32 {
        self.counters.heartbeat.load(Ordering::Relaxed)
    }
}

impl Drop for Evr {
    fn drop(&mut self) {
        // Stop workers before any sub-unit goes away. The flag covers a
        // mailbox already full of wakes.
        self.drain_stop
            .store(true, std::sync::atomic::Ordering::Release);
        let _ = self.drain_tx.try_send(DrainMsg::Stop);
        let _ = self
            .events
            .unsubscribe(EVENT_TS_COUNTER_RST, &self.seconds_cb);
        let threads: Vec<_> = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for t in threads {
            let _ = t.join();
        }
        self.engine.shutdown();
        tracing::info!(id = self.id, "EVR torn down");
    }
}
