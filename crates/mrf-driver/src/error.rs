//! Error types for the timing-card driver.

use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, MrfError>;

/// Errors that can occur while driving an EVG/EVR card.
///
/// Programming errors (out-of-range register access, use-after-teardown)
/// are panics at the call site, not variants here. Transient link faults
/// are handled internally and never surface as an `Err`.
#[derive(Debug, Error)]
pub enum MrfError {
    /// The register window does not look like the expected card.
    #[error("Bad device: {reason}")]
    BadDevice {
        /// What the signature check saw.
        reason: String,
    },

    /// A parameter is outside its hardware range. Nothing was applied.
    #[error("{what} {value} out of range (limit {limit})")]
    Range {
        /// Name of the offending parameter.
        what: &'static str,
        /// Value the caller passed.
        value: u64,
        /// Inclusive upper limit (or the rejected boundary).
        limit: u64,
    },

    /// A card id is already taken in the process-wide registry.
    #[error("Card id {id} already registered")]
    DuplicateId {
        /// The contested id.
        id: u32,
    },

    /// No card is registered under this id.
    #[error("No card registered under id {id}")]
    NotFound {
        /// The id that was looked up.
        id: u32,
    },

    /// The same (code, action) pair is already mapped.
    #[error("Event {code} already mapped to action {action}")]
    DuplicateMapping {
        /// Event code.
        code: u8,
        /// Action bit number.
        action: u32,
    },

    /// A sequence operation is illegal in the current lifecycle state.
    #[error("Cannot {op} a sequence in state {state}")]
    SequenceState {
        /// The rejected operation.
        op: &'static str,
        /// Human-readable current state.
        state: &'static str,
    },

    /// Both sequence RAMs are bound to other soft sequences.
    #[error("No free sequence RAM")]
    NoFreeRam,

    /// The timestamp engine has no valid time.
    #[error("Timestamp not valid")]
    TimestampInvalid,

    /// A data-buffer access fell outside the legal window.
    #[error("Data buffer access at {offset}+{len} outside [{low}, {high})")]
    BufferBounds {
        /// Requested byte offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// First legal offset.
        low: usize,
        /// One past the last legal offset.
        high: usize,
    },

    /// The hardware is busy with a previous request.
    #[error("{what} busy")]
    Busy {
        /// The contended resource.
        what: &'static str,
    },
}

impl MrfError {
    /// Create a range error.
    pub fn range(what: &'static str, value: impl Into<u64>, limit: impl Into<u64>) -> Self {
        Self::Range {
            what,
            value: value.into(),
            limit: limit.into(),
        }
    }

    /// Create a bad-device error.
    pub fn bad_device(reason: impl Into<String>) -> Self {
        Self::BadDevice {
            reason: reason.into(),
        }
    }
}
