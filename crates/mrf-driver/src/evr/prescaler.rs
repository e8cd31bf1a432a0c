//! Programmable prescaler sub-unit.

use mrf_chip::evr;

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// A divided-down copy of the event clock, routable to outputs.
#[derive(Debug)]
pub struct Prescaler {
    win: RegWindow,
    idx: usize,
}

impl Prescaler {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the prescaler family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Current divisor.
    #[must_use]
    pub fn divisor(&self) -> u32 {
        self.win.read32(evr::scaler(self.idx))
    }

    /// Set the divisor.
    ///
    /// # Errors
    ///
    /// Divisors below 2 cannot be generated by the divider chain.
    pub fn set_divisor(&self, div: u32) -> Result<()> {
        if div < 2 {
            return Err(MrfError::range("prescaler divisor", div, 2u32));
        }
        self.win.write32(evr::scaler(self.idx), div);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use std::sync::Arc;

    #[test]
    fn divisor_round_trip_and_range() {
        let sim = Arc::new(SimCard::evr());
        let ps = Prescaler::new(RegWindow::new(sim as Arc<dyn RegIo>), 1);
        ps.set_divisor(1000).unwrap();
        assert_eq!(ps.divisor(), 1000);
        assert!(ps.set_divisor(0).is_err());
        assert!(ps.set_divisor(1).is_err());
        assert_eq!(ps.divisor(), 1000);
    }
}
