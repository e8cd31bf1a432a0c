//! Event-trigger sub-unit.
//!
//! Each trigger transmits a fixed event code when its selected source
//! (multiplexed counter, external input, AC sync) fires.

use mrf_chip::evg::{self, trig_evt};

use crate::io::RegWindow;

/// One of the card's event triggers.
#[derive(Debug)]
pub struct TrigEvt {
    win: RegWindow,
    idx: usize,
}

impl TrigEvt {
    pub(crate) fn new(win: RegWindow, idx: usize) -> Self {
        Self { win, idx }
    }

    /// Index within the trigger family.
    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }

    fn ctrl(&self) -> usize {
        evg::trig_evt_ctrl(self.idx)
    }

    /// Event code this trigger transmits.
    #[must_use]
    pub fn code(&self) -> u8 {
        (self.win.read32(self.ctrl()) & trig_evt::CODE_MASK) as u8
    }

    /// Set the transmitted event code.
    pub fn set_code(&self, code: u8) {
        let _irq = self.win.lock_irq();
        let v = self.win.read32(self.ctrl()) & !trig_evt::CODE_MASK;
        self.win.write32(self.ctrl(), v | u32::from(code));
    }

    /// Whether the trigger is armed.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.win.read32(self.ctrl()) & trig_evt::ENABLE != 0
    }

    /// Arm or disarm the trigger.
    pub fn set_enabled(&self, ena: bool) {
        if ena {
            self.win.bit_set32(self.ctrl(), trig_evt::ENABLE);
        } else {
            self.win.bit_clr32(self.ctrl(), trig_evt::ENABLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use std::sync::Arc;

    #[test]
    fn code_and_enable_round_trip() {
        let sim = Arc::new(SimCard::evg());
        let t = TrigEvt::new(RegWindow::new(sim as Arc<dyn RegIo>), 3);
        t.set_code(0x2A);
        t.set_enabled(true);
        assert_eq!(t.code(), 0x2A);
        assert!(t.enabled());
        t.set_code(0x10);
        assert!(t.enabled());
        assert_eq!(t.code(), 0x10);
    }
}
