//! Front-panel I/O sub-units.

use mrf_chip::evg::{self, fp_input};
use mrf_chip::evr::output_map;

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// One front-panel input: injects an event code upstream and can raise
/// the external interrupt cause.
#[derive(Debug)]
pub struct FpInput {
    win: RegWindow,
    idx: usize,
}

impl FpInput {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the input family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    fn ctrl(&self) -> usize {
        evg::fp_input_ctrl(self.idx)
    }

    /// Event code transmitted on an active edge; 0 disables.
    #[must_use]
    pub fn external_code(&self) -> u8 {
        (self.win.read32(self.ctrl()) & fp_input::CODE_MASK) as u8
    }

    /// Set the transmitted event code.
    pub fn set_external_code(&self, code: u8) {
        let _irq = self.win.lock_irq();
        let v = self.win.read32(self.ctrl()) & !fp_input::CODE_MASK;
        self.win.write32(self.ctrl(), v | u32::from(code));
    }

    /// Whether edges on this input raise the external interrupt.
    #[must_use]
    pub fn external_irq_enabled(&self) -> bool {
        self.win.read32(self.ctrl()) & fp_input::EXT_IRQ_ENA != 0
    }

    /// Enable or disable the external interrupt for this input. Used by
    /// the timestamp-source configuration.
    pub fn enable_external_irq(&self, ena: bool) {
        if ena {
            self.win.bit_set32(self.ctrl(), fp_input::EXT_IRQ_ENA);
        } else {
            self.win.bit_clr32(self.ctrl(), fp_input::EXT_IRQ_ENA);
        }
    }
}

/// One front-panel output mux, mapped like the receiver outputs.
#[derive(Debug)]
pub struct FpOutput {
    win: RegWindow,
    idx: usize,
}

impl FpOutput {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the output family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Currently selected source code.
    #[must_use]
    pub fn source(&self) -> u16 {
        self.win.read16(evg::fp_output_map(self.idx))
    }

    /// Route the output.
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
        self.win.write16(evg::fp_output_map(self.idx), source);
        Ok(())
    }
}
