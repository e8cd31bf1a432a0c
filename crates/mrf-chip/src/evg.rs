//! EVG register map.
//!
//! The generator shares the first four core words with the EVR; the rest of
//! the map covers event triggers, multiplexed counters, the distributed bus,
//! the software event, front-panel I/O and the two sequence RAMs.

// ── Core block ───────────────────────────────────────────────────────────────

/// Link and bus status. RO.
pub const STATUS: usize = 0x000;
/// Master control register. RW.
pub const CONTROL: usize = 0x004;
/// Interrupt cause flags. Write-one-to-clear.
pub const IRQ_FLAG: usize = 0x008;
/// Per-cause interrupt enables plus the master enable bit. RW.
pub const IRQ_ENABLE: usize = 0x00C;
/// Transmit data-buffer control (DBCR).
pub const DATA_BUF_CTRL: usize = 0x020;
/// Firmware version and form factor. RO.
pub const FW_VERSION: usize = 0x02C;

// ── Clock block ──────────────────────────────────────────────────────────────

/// Microsecond divider, 16 bits used. Kept in lock-step with the synthesizer.
pub const USEC_DIV: usize = 0x04C;
/// Event-clock source select (internal synthesizer vs external RF), 8 bits.
pub const CLOCK_SOURCE: usize = 0x050;
/// External RF divider select, 8 bits.
pub const RF_DIV: usize = 0x052;
/// Fractional-synthesizer control word.
pub const FRAC_SYNTH_WORD: usize = 0x080;

// ── Software event ───────────────────────────────────────────────────────────

/// Software event control, 8 bits (`sw_event` bits).
pub const SW_EVENT_CONTROL: usize = 0x060;
/// Software event code, 8 bits.
pub const SW_EVENT_CODE: usize = 0x062;

// ── Sequencer ────────────────────────────────────────────────────────────────

/// Number of sequence RAMs on the card.
pub const NUM_SEQ_RAM: usize = 2;
/// Rows in one sequence RAM.
pub const SEQ_RAM_ROWS: usize = 2048;

/// Sequence RAM `i` control register.
#[must_use]
pub const fn seq_ctrl(i: usize) -> usize {
    0x070 + 4 * i
}

/// Sequence RAM `i`, row `n`: 32-bit tick offset.
#[must_use]
pub const fn seq_ram_ts(i: usize, n: usize) -> usize {
    0x8000 + 0x4000 * i + 8 * n
}

/// Sequence RAM `i`, row `n`: event code in the low byte of this word.
#[must_use]
pub const fn seq_ram_code(i: usize, n: usize) -> usize {
    0x8000 + 0x4000 * i + 8 * n + 4
}

// ── Sub-unit blocks ──────────────────────────────────────────────────────────

/// Number of event triggers.
pub const NUM_TRIG_EVT: usize = 8;
/// Number of multiplexed counters.
pub const NUM_MXC: usize = 8;
/// Number of distributed-bus bits.
pub const NUM_DBUS_BIT: usize = 8;
/// Number of front-panel inputs.
pub const NUM_FP_INPUT: usize = 2;
/// Number of front-panel outputs.
pub const NUM_FP_OUTPUT: usize = 4;

/// Event trigger `i` control (code in bits 7:0, enable above).
#[must_use]
pub const fn trig_evt_ctrl(i: usize) -> usize {
    0x100 + 4 * i
}

/// Multiplexed counter `i` control.
#[must_use]
pub const fn mxc_ctrl(i: usize) -> usize {
    0x180 + 8 * i
}
/// Multiplexed counter `i` 32-bit prescaler.
#[must_use]
pub const fn mxc_prescaler(i: usize) -> usize {
    0x184 + 8 * i
}

/// Distributed-bus bit `i` source map, 4 bits per nibble of one register.
pub const DBUS_MAP: usize = 0x140;

/// Front-panel input `i` control (external event code, IRQ enable).
#[must_use]
pub const fn fp_input_ctrl(i: usize) -> usize {
    0x1C0 + 4 * i
}
/// Front-panel output `i` source map (16-bit).
#[must_use]
pub const fn fp_output_map(i: usize) -> usize {
    0x1E0 + 2 * i
}

/// Transmit data-buffer window base (2 KB, word-accessed).
pub const DATA_TX_BASE: usize = 0x800;

// ── Bit definitions ──────────────────────────────────────────────────────────

/// `CONTROL` bits.
pub mod control {
    /// Master enable for event generation.
    pub const ENABLE: u32 = 1 << 31;
}

/// `IRQ_FLAG` / `IRQ_ENABLE` cause bits.
pub mod irq {
    /// Receiver violation on the upstream port.
    pub const RXVIO: u32 = 0x01;
    /// Transfer FIFO overflowed.
    pub const FIFOFULL: u32 = 0x02;
    /// Data buffer transmission complete.
    pub const BUFFULL: u32 = 0x20;
    /// External input interrupt.
    pub const EXT_IRQ: u32 = 0x40;
    /// Sequence RAM `i` started.
    #[must_use]
    pub const fn seq_start(i: usize) -> u32 {
        1 << (8 + i)
    }
    /// Sequence RAM `i` stopped (end-of-sequence reached).
    #[must_use]
    pub const fn seq_stop(i: usize) -> u32 {
        1 << (12 + i)
    }
    /// Master interrupt enable (`IRQ_ENABLE` only).
    pub const MASTER: u32 = 1 << 31;
}

/// `SEQ_CTRL` bits.
pub mod seq_ctrl {
    /// Trigger source select, bits 7:0.
    pub const TRIG_MASK: u32 = 0x0000_00FF;
    /// Software trigger.
    pub const SW_TRIG: u32 = 1 << 16;
    /// Arm the RAM (enable).
    pub const ENABLE: u32 = 1 << 17;
    /// Disarm the RAM.
    pub const DISABLE: u32 = 1 << 18;
    /// Reset the RAM's playback pointer.
    pub const RESET: u32 = 1 << 19;
    /// Re-arm automatically at end of sequence (auto run mode).
    pub const RECYCLE: u32 = 1 << 20;
    /// Disarm at end of sequence (single run mode).
    pub const SINGLE: u32 = 1 << 21;
    /// RAM is armed. RO.
    pub const ENABLED: u32 = 1 << 24;
    /// RAM is currently playing. RO.
    pub const RUNNING: u32 = 1 << 25;
}

/// `SW_EVENT_CONTROL` bits.
pub mod sw_event {
    /// Allow software event injection.
    pub const ENABLE: u8 = 1 << 0;
    /// An injected code is waiting for a link slot. RO.
    pub const PEND: u8 = 1 << 1;
}

/// `CLOCK_SOURCE` bits.
pub mod clock_source {
    /// Event clock comes from the external RF input instead of the
    /// internal fractional synthesizer.
    pub const EXTRF: u8 = 1 << 0;
}

/// `TRIG_EVT_CTRL` bits.
pub mod trig_evt {
    /// Event code to transmit, bits 7:0.
    pub const CODE_MASK: u32 = 0x0000_00FF;
    /// Enable this trigger.
    pub const ENABLE: u32 = 1 << 8;
}

/// `MXC_CTRL` bits.
pub mod mxc {
    /// Output polarity.
    pub const POLARITY: u32 = 1 << 30;
    /// Counter output state. RO.
    pub const STATE: u32 = 1 << 31;
}

/// `FP_INPUT_CTRL` bits.
pub mod fp_input {
    /// Event code transmitted on an edge of this input, bits 7:0.
    pub const CODE_MASK: u32 = 0x0000_00FF;
    /// Generate `irq::EXT_IRQ` on an edge of this input.
    pub const EXT_IRQ_ENA: u32 = 1 << 24;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ram_rows_are_8_bytes() {
        assert_eq!(seq_ram_ts(0, 0), 0x8000);
        assert_eq!(seq_ram_code(0, 0), 0x8004);
        assert_eq!(seq_ram_ts(0, 1) - seq_ram_ts(0, 0), 8);
        assert_eq!(seq_ram_ts(1, 0), 0xC000);
        // Last row of RAM 0 stays below RAM 1.
        assert!(seq_ram_code(0, SEQ_RAM_ROWS - 1) < seq_ram_ts(1, 0));
    }

    #[test]
    fn irq_cause_bits_are_disjoint() {
        let all = irq::RXVIO
            | irq::FIFOFULL
            | irq::BUFFULL
            | irq::EXT_IRQ
            | irq::seq_start(0)
            | irq::seq_start(1)
            | irq::seq_stop(0)
            | irq::seq_stop(1);
        assert_eq!(all.count_ones(), 8);
        assert_eq!(all & irq::MASTER, 0);
    }

    #[test]
    fn shared_core_block_matches_evr() {
        assert_eq!(STATUS, crate::evr::STATUS);
        assert_eq!(CONTROL, crate::evr::CONTROL);
        assert_eq!(IRQ_FLAG, crate::evr::IRQ_FLAG);
        assert_eq!(IRQ_ENABLE, crate::evr::IRQ_ENABLE);
        assert_eq!(DATA_BUF_CTRL, 0x20);
    }
}
