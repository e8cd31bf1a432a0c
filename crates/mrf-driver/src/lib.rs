//! Hard-real-time core driver for MRF EVG/EVR timing distribution cards.
//!
//! An event generator (EVG) transmits timestamped 8-bit event codes over
//! an optical link; event receivers (EVRs) re-clock the stream and turn
//! selected codes into pulses, logic levels and timestamped software
//! notifications. This crate is everything between a card's memory-mapped
//! register file and the control-system integration layer:
//!
//! - the EVR event-action pipeline (mapping RAM, FIFO drain, per-event
//!   fan-out and re-arming) — [`evr::EventTable`]
//! - the EVR timestamp engine (seconds-tick validation, latch path,
//!   tick→nanosecond conversion) — [`evr::TimeEngine`]
//! - the EVG sequence engine (edit/commit/load/enable lifecycle over two
//!   sequence RAMs) — [`evg::SeqMgr`]
//! - the distributed data buffer (framed 2 KB frames with a big-endian
//!   protocol id) — [`dbuf`]
//! - the register-window and interrupt-service discipline they share —
//!   [`io`], [`work`]
//!
//! Bus discovery and MMIO mapping live outside this crate: the bus layer
//! hands over a mapped base pointer (wrapped in [`io::MmioWindow`]) and an
//! interrupt source, and installs [`Evr::isr`]/[`Evg::isr`] against it.
//! The [`sim`] module provides a software-simulated card behind the same
//! register interface, so the full stack runs in CI without hardware.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use mrf_driver::{Evr, EvrConfig, sim::SimCard};
//!
//! # fn main() -> mrf_driver::Result<()> {
//! let card = Arc::new(SimCard::evr());
//! let evr = Evr::new(0, card, &EvrConfig::default())?;
//! evr.enable(true);
//! evr.clock_set(125.0)?;
//!
//! evr.subscribe_event(10, Arc::new(|ev| {
//!     println!("event {} at {}:{}", ev.code, ev.sec, ev.evt);
//! }))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod dbuf;
mod error;
pub mod evg;
pub mod evr;
pub mod io;
mod registry;
pub mod sim;
pub mod work;

pub use error::{MrfError, Result};
pub use evg::{Evg, EvgClockSource, EvgConfig};
pub use evr::{Evr, EvrConfig, FifoEvent, ScanKind, Timestamp, TsSource};
pub use registry::{Card, CardRegistry};

/// Commonly used types.
pub mod prelude {
    pub use crate::dbuf::{DataBufRx, DataBufTx};
    pub use crate::evg::{SeqMgr, SeqRunMode, SeqState, SoftSeq};
    pub use crate::evr::{EventCallback, EventTable, SubUnit, TimeEngine};
    pub use crate::io::{BusEndian, MmioWindow, RegIo, RegWindow};
    pub use crate::work::{CallbackEngine, Priority, Scan};
    pub use crate::{
        Card, CardRegistry, Evg, EvgClockSource, EvgConfig, Evr, EvrConfig, FifoEvent, MrfError,
        Result, ScanKind, Timestamp, TsSource,
    };
}
