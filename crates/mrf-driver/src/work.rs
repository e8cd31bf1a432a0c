//! Deferred-work machinery shared by both card types.
//!
//! The interrupt handler never blocks; anything slower than a register
//! write is handed to the [`CallbackEngine`]: three bounded work queues at
//! low/medium/high priority, drained by dedicated threads, plus a timer
//! lane for self-rescheduling callbacks (the 100 ms link poll).
//!
//! Tests run the engine in manual mode: no threads are spawned and the
//! test pumps the queues itself, which makes every hand-off deterministic.
//!
//! [`Scan`] is the notification primitive handed to the record layer: an
//! external hook list plus a request counter, safe to fire from the ISR.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A queued unit of deferred work.
pub type WorkFn = Box<dyn FnOnce() + Send>;

/// Queue priority classes, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Bulk notification work.
    Low,
    /// Link polling, data-buffer reception.
    Medium,
    /// Completion legs that unblock hardware re-arming.
    High,
}

/// Number of priority classes; one re-arm sentinel is issued per class.
pub const NUM_PRIORITIES: usize = 3;

// Sized so a full-FIFO burst of re-arm sentinels cannot be shed.
const QUEUE_DEPTH: usize = 2048;

enum WorkMsg {
    Run(WorkFn),
    Stop,
}

struct DelayedItem {
    due: Instant,
    seq: u64,
    prio: Priority,
    work: WorkFn,
}

impl PartialEq for DelayedItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedItem {}
impl PartialOrd for DelayedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum TimerMsg {
    Schedule(DelayedItem),
    Stop,
}

struct Lane {
    tx: Sender<WorkMsg>,
    rx: Receiver<WorkMsg>,
    dropped: AtomicU32,
}

/// Three-priority deferred-work engine with a timer lane.
pub struct CallbackEngine {
    lanes: [Lane; NUM_PRIORITIES],
    timer_tx: Mutex<Option<Sender<TimerMsg>>>,
    // Manual mode keeps delayed items here instead of a timer thread.
    manual_delayed: Mutex<Vec<(Priority, WorkFn)>>,
    threaded: bool,
    stopping: AtomicBool,
    seq: AtomicU32,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for CallbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackEngine")
            .field("threaded", &self.threaded)
            .finish()
    }
}

impl CallbackEngine {
    fn lane() -> Lane {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        Lane {
            tx,
            rx,
            dropped: AtomicU32::new(0),
        }
    }

    /// Build the engine and spawn one worker thread per priority plus the
    /// timer thread.
    #[must_use]
    pub fn spawn() -> Arc<Self> {
        let engine = Arc::new(Self {
            lanes: [Self::lane(), Self::lane(), Self::lane()],
            timer_tx: Mutex::new(None),
            manual_delayed: Mutex::new(Vec::new()),
            threaded: true,
            stopping: AtomicBool::new(false),
            seq: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(NUM_PRIORITIES + 1);
        for (i, name) in ["mrf-cb-low", "mrf-cb-med", "mrf-cb-high"]
            .iter()
            .enumerate()
        {
            let rx = engine.lanes[i].rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name((*name).into())
                    .spawn(move || worker_loop(&rx))
                    .expect("spawn callback worker"),
            );
        }

        let (ttx, trx) = bounded::<TimerMsg>(QUEUE_DEPTH);
        {
            // Weak so the timer thread cannot keep the engine alive by itself.
            let engine = Arc::downgrade(&engine);
            workers.push(
                std::thread::Builder::new()
                    .name("mrf-cb-timer".into())
                    .spawn(move || timer_loop(&trx, &engine))
                    .expect("spawn callback timer"),
            );
        }
        *engine.timer_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ttx);
        *engine.workers.lock().unwrap_or_else(PoisonError::into_inner) = workers;

        engine
    }

    /// Build the engine without threads; tests drive it with
    /// [`CallbackEngine::pump`] and [`CallbackEngine::fire_delayed`].
    #[must_use]
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            lanes: [Self::lane(), Self::lane(), Self::lane()],
            timer_tx: Mutex::new(None),
            manual_delayed: Mutex::new(Vec::new()),
            threaded: false,
            stopping: AtomicBool::new(false),
            seq: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue work at `prio`. Never blocks; a full queue drops the item
    /// and counts it (the caller may be the ISR).
    pub fn request(&self, prio: Priority, work: WorkFn) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        let lane = &self.lanes[prio as usize];
        if lane.tx.try_send(WorkMsg::Run(work)).is_err() {
            let n = lane.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(?prio, dropped = n, "callback queue full, work dropped");
        }
    }

    /// Enqueue work to run no earlier than `delay` from now.
    pub fn request_delayed(&self, delay: Duration, prio: Priority, work: WorkFn) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        if self.threaded {
            let item = DelayedItem {
                due: Instant::now() + delay,
                seq: u64::from(self.seq.fetch_add(1, Ordering::Relaxed)),
                prio,
                work,
            };
            let tx = self
                .timer_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(tx) = tx {
                if tx.try_send(TimerMsg::Schedule(item)).is_err() {
                    tracing::warn!("timer queue full, delayed work dropped");
                }
            }
        } else {
            self.manual_delayed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((prio, work));
        }
    }

    /// Count of items dropped on a full queue.
    #[must_use]
    pub fn dropped(&self, prio: Priority) -> u32 {
        self.lanes[prio as usize].dropped.load(Ordering::Relaxed)
    }

    /// Manual mode: run everything currently queued at `prio`.
    /// Returns the number of items executed.
    pub fn pump(&self, prio: Priority) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.lanes[prio as usize].rx.try_recv() {
            if let WorkMsg::Run(f) = msg {
                f();
                n += 1;
            }
        }
        n
    }

    /// Manual mode: pump all three queues, highest priority first, until
    /// every queue is empty (pumped work may enqueue more work).
    pub fn pump_all(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.pump(Priority::High) + self.pump(Priority::Medium) + self.pump(Priority::Low);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Manual mode: move every pending delayed item into its queue as if
    /// its deadline had passed. Returns how many were due.
    pub fn fire_delayed(&self) -> usize {
        let items: Vec<_> = std::mem::take(
            &mut *self
                .manual_delayed
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let n = items.len();
        for (prio, work) in items {
            self.request(prio, work);
        }
        n
    }

    /// Stop accepting work, wake all workers and join them.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.threaded {
            return;
        }
        if let Some(tx) = self
            .timer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(TimerMsg::Stop);
        }
        for lane in &self.lanes {
            let _ = lane.tx.send(WorkMsg::Stop);
        }
        let workers: Vec<_> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for w in workers {
            let _ = w.join();
        }
    }
}

impl Drop for CallbackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Receiver<WorkMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkMsg::Run(f) => f(),
            WorkMsg::Stop => break,
        }
    }
}

fn timer_loop(rx: &Receiver<TimerMsg>, engine: &std::sync::Weak<CallbackEngine>) {
    let mut heap: BinaryHeap<DelayedItem> = BinaryHeap::new();
    loop {
        let timeout = heap
            .peek()
            .map_or(Duration::from_secs(3600), |i| {
                i.due.saturating_duration_since(Instant::now())
            });
        match rx.recv_timeout(timeout) {
            Ok(TimerMsg::Schedule(item)) => heap.push(item),
            Ok(TimerMsg::Stop) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        while heap.peek().is_some_and(|i| i.due <= Instant::now()) {
            let item = heap.pop().expect("peeked item");
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.request(item.prio, item.work);
        }
    }
}

/// Scan-request point: the notification seam to the record layer.
///
/// The external integration layer attaches hooks; the driver fires
/// [`Scan::request`] from ISR or worker context. Hooks must be cheap and
/// must not take the card mutex.
#[derive(Default)]
pub struct Scan {
    count: AtomicU32,
    hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scan {
    /// New scan point with no hooks.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a notification hook.
    pub fn subscribe(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Fire the scan request: bump the counter and run every hook.
    pub fn request(&self) {
        self.count.fetch_add(1, Ordering::Release);
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            hook();
        }
    }

    /// Number of requests fired so far.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}
