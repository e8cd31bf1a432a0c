//! Pulse generator sub-unit.

use mrf_chip::evr::{self, pulser};

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// One of the card's pulse generators: a delay/width pair clocked off the
/// event clock through its own prescaler, fired by mapping-RAM actions.
#[derive(Debug)]
pub struct Pulser {
    win: RegWindow,
    idx: usize,
}

impl Pulser {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the pulser family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Whether the pulser drives its output.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.win.read32(evr::pulser_ctrl(self.idx)) & pulser::ENABLE != 0
    }

    /// Enable or disable the pulser.
    pub fn set_enabled(&self, ena: bool) {
        if ena {
            self.win.bit_set32(evr::pulser_ctrl(self.idx), pulser::ENABLE);
        } else {
            self.win.bit_clr32(evr::pulser_ctrl(self.idx), pulser::ENABLE);
        }
    }

    /// Whether the output is inverted.
    #[must_use]
    pub fn polarity_inverted(&self) -> bool {
        self.win.read32(evr::pulser_ctrl(self.idx)) & pulser::POLARITY != 0
    }

    /// Invert or restore the output sense.
    pub fn set_polarity_inverted(&self, inv: bool) {
        if inv {
            self.win.bit_set32(evr::pulser_ctrl(self.idx), pulser::POLARITY);
        } else {
            self.win.bit_clr32(evr::pulser_ctrl(self.idx), pulser::POLARITY);
        }
    }

    /// Whether pulse mask `mask_id` gates this pulser.
    ///
    /// # Errors
    ///
    /// `mask_id` must name one of the four pulse masks.
    pub fn masked_by(&self, mask_id: u32) -> Result<bool> {
        if mask_id >= pulser::NUM_MASKS {
            return Err(MrfError::range("pulse mask", mask_id, pulser::NUM_MASKS - 1));
        }
        Ok(self.win.read32(evr::pulser_ctrl(self.idx)) & pulser::mask_gate(mask_id) != 0)
    }

    /// Gate or ungate this pulser by pulse mask `mask_id`.
    ///
    /// # Errors
    ///
    /// `mask_id` must name one of the four pulse masks.
    pub fn set_masked_by(&self, mask_id: u32, gated: bool) -> Result<()> {
        if mask_id >= pulser::NUM_MASKS {
            return Err(MrfError::range("pulse mask", mask_id, pulser::NUM_MASKS - 1));
        }
        if gated {
            self.win
                .bit_set32(evr::pulser_ctrl(self.idx), pulser::mask_gate(mask_id));
        } else {
            self.win
                .bit_clr32(evr::pulser_ctrl(self.idx), pulser::mask_gate(mask_id));
        }
        Ok(())
    }

    /// Pulse delay in prescaled event-clock ticks.
    #[must_use]
    pub fn delay(&self) -> u32 {
        self.win.read32(evr::pulser_dely(self.idx))
    }

    /// Set the pulse delay.
    pub fn set_delay(&self, ticks: u32) {
        self.win.write32(evr::pulser_dely(self.idx), ticks);
    }

    /// Pulse width in prescaled event-clock ticks.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.win.read32(evr::pulser_wdth(self.idx))
    }

    /// Set the pulse width.
    pub fn set_width(&self, ticks: u32) {
        self.win.write32(evr::pulser_wdth(self.idx), ticks);
    }

    /// Prescaler dividing the event clock for this pulser.
    #[must_use]
    pub fn prescaler(&self) -> u32 {
        self.win.read32(evr::pulser_scal(self.idx))
    }

    /// Set the prescaler.
    ///
    /// # Errors
    ///
    /// Zero would stop the pulser clock and is rejected.
    pub fn set_prescaler(&self, div: u32) -> Result<()> {
        if div == 0 {
            return Err(MrfError::range("pulser prescaler", div, u64::from(u32::MAX)));
        }
        self.win.write32(evr::pulser_scal(self.idx), div);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use std::sync::Arc;

    fn pulser() -> Pulser {
        let sim = Arc::new(SimCard::evr());
        Pulser::new(RegWindow::new(sim as Arc<dyn RegIo>), 2)
    }

    #[test]
    fn enable_and_polarity_round_trip() {
        let p = pulser();
        assert!(!p.enabled());
        p.set_enabled(true);
        assert!(p.enabled());
        p.set_polarity_inverted(true);
        assert!(p.polarity_inverted());
        assert!(p.enabled());
        p.set_enabled(false);
        assert!(!p.enabled());
        assert!(p.polarity_inverted());
    }

    #[test]
    fn width_delay_prescaler() {
        let p = pulser();
        p.set_delay(1000);
        p.set_width(50);
        p.set_prescaler(4).unwrap();
        assert_eq!(p.delay(), 1000);
        assert_eq!(p.width(), 50);
        assert_eq!(p.prescaler(), 4);
        assert!(p.set_prescaler(0).is_err());
    }

    #[test]
    fn mask_gates() {
        let p = pulser();
        p.set_masked_by(1, true).unwrap();
        assert!(p.masked_by(1).unwrap());
        assert!(!p.masked_by(0).unwrap());
        assert!(p.masked_by(4).is_err());
        assert!(p.set_masked_by(9, true).is_err());
    }
}
