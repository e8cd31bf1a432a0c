//! Multiplexed-counter sub-unit.
//!
//! Square-wave generators dividing the event clock; their outputs feed
//! the sequencer trigger mux, the event triggers and the distributed bus.

use mrf_chip::evg::{self, mxc};

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// One multiplexed counter.
#[derive(Debug)]
pub struct Mxc {
    win: RegWindow,
    idx: usize,
}

impl Mxc {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the counter family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Current divisor.
    #[must_use]
    pub fn prescaler(&self) -> u32 {
        self.win.read32(evg::mxc_prescaler(self.idx))
    }

    /// Set the divisor.
    ///
    /// # Errors
    ///
    /// The counter chain cannot divide by less than 2.
    pub fn set_prescaler(&self, div: u32) -> Result<()> {
        if div < 2 {
            return Err(MrfError::range("mux counter prescaler", div, 2u32));
        }
        self.win.write32(evg::mxc_prescaler(self.idx), div);
        Ok(())
    }

    /// Whether the output is inverted.
    #[must_use]
    pub fn polarity_inverted(&self) -> bool {
        self.win.read32(evg::mxc_ctrl(self.idx)) & mxc::POLARITY != 0
    }

    /// Invert or restore the output sense.
    pub fn set_polarity_inverted(&self, inv: bool) {
        if inv {
            self.win.bit_set32(evg::mxc_ctrl(self.idx), mxc::POLARITY);
        } else {
            self.win.bit_clr32(evg::mxc_ctrl(self.idx), mxc::POLARITY);
        }
    }

    /// Live output state.
    #[must_use]
    pub fn output_high(&self) -> bool {
        self.win.read32(evg::mxc_ctrl(self.idx)) & mxc::STATE != 0
    }

    /// Output frequency in Hz for a given event clock.
    #[must_use]
    pub fn frequency(&self, event_clock_hz: f64) -> f64 {
        let div = self.prescaler();
        if div == 0 {
            return 0.0;
        }
        event_clock_hz / f64::from(div)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use std::sync::Arc;

    #[test]
    fn prescaler_and_polarity() {
        let sim = Arc::new(SimCard::evg());
        let m = Mxc::new(RegWindow::new(sim as Arc<dyn RegIo>), 5);
        m.set_prescaler(125_000).unwrap();
        assert_eq!(m.prescaler(), 125_000);
        assert!(m.set_prescaler(1).is_err());
        m.set_polarity_inverted(true);
        assert!(m.polarity_inverted());
        let f = m.frequency(125e6);
        assert!((f - 1000.0).abs() < 1e-9);
    }
}
