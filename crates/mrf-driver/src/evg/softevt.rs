//! Software event injection.
//!
//! A code written here is transmitted in the next free link slot. The
//! pending bit guards the code register: writing while a previous code
//! waits would clobber it.

use mrf_chip::evg::{self, sw_event};

use crate::error::{MrfError, Result};
use crate::io::RegWindow;

/// The card's software-event port.
#[derive(Debug)]
pub struct SoftEvt {
    win: RegWindow,
}

impl SoftEvt {
    pub(crate) fn new(win: RegWindow) -> Self {
        Self { win }
    }

    /// Whether software injection is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.win.read8(evg::SW_EVENT_CONTROL) & sw_event::ENABLE != 0
    }

    /// Allow or block software injection.
    pub fn set_enabled(&self, ena: bool) {
        let _irq = self.win.lock_irq();
        let v = self.win.read8(evg::SW_EVENT_CONTROL);
        let v = if ena {
            v | sw_event::ENABLE
        } else {
            v & !sw_event::ENABLE
        };
        self.win.write8(evg::SW_EVENT_CONTROL, v);
    }

    /// Whether a previously injected code still waits for a link slot.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.win.read8(evg::SW_EVENT_CONTROL) & sw_event::PEND != 0
    }

    /// Inject `code` into the event stream.
    ///
    /// # Errors
    ///
    /// Code 0 is not an event; a still-pending previous injection makes
    /// the port busy.
    pub fn inject(&self, code: u8) -> Result<()> {
        if code == 0 {
            return Err(MrfError::range("event code", 0u32, 255u32));
        }
        if self.pending() {
            return Err(MrfError::Busy {
                what: "software event",
            });
        }
        self.win.write8(evg::SW_EVENT_CODE, code);
        Ok(())
    }

    /// Last injected code.
    #[must_use]
    pub fn code(&self) -> u8 {
        self.win.read8(evg::SW_EVENT_CODE)
    }
}
