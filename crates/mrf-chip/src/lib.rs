//! Hardware description of MRF EVG/EVR timing cards.
//!
//! This crate carries no runtime logic: register offsets, bit definitions,
//! the PLX PCI-bridge control bits, and the fractional-synthesizer math.
//! Everything here is a plain constant or a pure function, shared between
//! the driver crate and its simulated card.
//!
//! Offsets are the host-side view, little-endian after the register
//! window's per-word byte reversal.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod evg;
pub mod evr;
pub mod fracsynth;
pub mod plx;

/// Event codes carried on the optical link are 8 bits; 0 is "no event".
pub const EVENT_CODE_MAX: u32 = 255;

/// Event code that resets the EVR seconds counter (the 1 Hz seconds tick).
pub const EVENT_TS_COUNTER_RST: u8 = 0x7D;

/// Terminator sentinel appended to every sequence-RAM program.
pub const EVENT_SEQ_END: u8 = 0x7F;

/// Offset between the Unix epoch (1970) and the control-system epoch (1990),
/// in seconds. The link seconds counter runs on POSIX time.
pub const POSIX_TIME_AT_EPICS_EPOCH: u32 = 631_152_000;

/// Fractional-synthesizer reference clock on all supported cards, in MHz.
pub const FRAC_SYNTH_REF_MHZ: f64 = 24.0;
