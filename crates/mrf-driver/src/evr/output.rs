//! Output-mapping sub-unit.
//!
//! Every logic-level output is a 16-bit mux register selecting its source
//! (a pulser, a prescaler, a distributed-bus bit, or forced high/low).

use mrf_chip::evr::output_map;

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// Families of mappable outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Front-panel TTL outputs.
    FrontPanel,
    /// Universal-module front-panel slots.
    Universal,
    /// Rear transition-module lines.
    Transition,
    /// The bus-interrupt pulse mapping.
    Interrupt,
}

/// One output mux.
#[derive(Debug)]
pub struct OutputMux {
    win: RegWindow,
    offset: usize,
}

impl OutputMux {
    pub(crate) fn new(win: RegWindow, offset: usize) -> Self {
        Self { win, offset }
    }

    /// Currently selected source code.
    #[must_use]
    pub fn source(&self) -> u16 {
        self.win.read16(self.offset)
    }

    /// Route the output to `source`.
    ///
    /// # Errors
    ///
    /// Source codes above [`output_map::SOURCE_MAX`] do not exist.
    pub fn set_source(&self, source: u16) -> Result<()> {
        if source > output_map::SOURCE_MAX {
            return Err(MrfError::range(
                "output source",
                source,
                output_map::SOURCE_MAX,
            ));
        }
        self.win.write16(self.offset, source);
        Ok(())
    }

    /// Park the output low.
    pub fn force_low(&self) {
        self.win.write16(self.offset, output_map::FORCE_LOW);
    }
}
