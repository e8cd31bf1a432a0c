//! EVR register map.
//!
//! Offsets follow the modular-register-map firmware. The first four words
//! (status, control, interrupt flag, interrupt enable) are shared with the
//! EVG; everything past 0x040 is receiver-specific.

// ── Core block ───────────────────────────────────────────────────────────────

/// Link and distributed-bus status. RO.
pub const STATUS: usize = 0x000;
/// Master control register. RW.
pub const CONTROL: usize = 0x004;
/// Interrupt cause flags. Write-one-to-clear.
pub const IRQ_FLAG: usize = 0x008;
/// Per-cause interrupt enables plus the master enable bit. RW.
pub const IRQ_ENABLE: usize = 0x00C;
/// Pulse mapping for the bus-interrupt output (16-bit field).
pub const IRQ_PULSE_MAP: usize = 0x012;
/// Receive data-buffer control (DBCR).
pub const DATA_BUF_CTRL: usize = 0x020;
/// Transmit data-buffer control (TXDBCR).
pub const DATA_TX_CTRL: usize = 0x024;
/// Firmware version and form factor. RO.
pub const FW_VERSION: usize = 0x02C;

// ── Timestamp block ──────────────────────────────────────────────────────────

/// Timestamp counter prescaler, 16 bits. 0 selects the external TS clock.
pub const COUNTER_PS: usize = 0x040;
/// Microsecond divider, 16 bits used. Kept in lock-step with `FRAC_DIV`.
pub const USEC_DIV: usize = 0x04C;
/// Clock/PLL control and status.
pub const CLK_CTRL: usize = 0x050;
/// Current seconds counter (link POSIX seconds). RO.
pub const TS_SEC: usize = 0x060;
/// Current timestamp event (tick) counter. RO.
pub const TS_EVT: usize = 0x064;
/// Seconds counter captured by `control::TSLTCH`. RO.
pub const TS_SEC_LATCH: usize = 0x068;
/// Tick counter captured by `control::TSLTCH`. RO.
pub const TS_EVT_LATCH: usize = 0x06C;

// ── Event FIFO ───────────────────────────────────────────────────────────────

/// Seconds field of the FIFO head. RO.
pub const EVT_FIFO_SEC: usize = 0x070;
/// Tick field of the FIFO head. RO.
pub const EVT_FIFO_EVT: usize = 0x074;
/// Event code of the FIFO head; reading pops the entry. 0 when empty.
pub const EVT_FIFO_CODE: usize = 0x078;

/// Depth of the hardware event FIFO.
pub const EVT_FIFO_DEPTH: usize = 512;

// ── Clock synthesis ──────────────────────────────────────────────────────────

/// Fractional-synthesizer control word.
pub const FRAC_DIV: usize = 0x080;

// ── Sub-unit blocks ──────────────────────────────────────────────────────────

/// Prescaler `i` divisor register (32-bit).
#[must_use]
pub const fn scaler(i: usize) -> usize {
    0x100 + 4 * i
}

/// Pulser `i` control register (enable, polarity, mask gates).
#[must_use]
pub const fn pulser_ctrl(i: usize) -> usize {
    0x200 + 0x10 * i
}
/// Pulser `i` prescaler.
#[must_use]
pub const fn pulser_scal(i: usize) -> usize {
    0x204 + 0x10 * i
}
/// Pulser `i` delay in event-clock ticks.
#[must_use]
pub const fn pulser_dely(i: usize) -> usize {
    0x208 + 0x10 * i
}
/// Pulser `i` width in event-clock ticks.
#[must_use]
pub const fn pulser_wdth(i: usize) -> usize {
    0x20C + 0x10 * i
}

/// Front-panel output `i` source map (16-bit).
#[must_use]
pub const fn output_map_fp(i: usize) -> usize {
    0x400 + 2 * i
}
/// Universal front-panel output `i` source map (16-bit).
#[must_use]
pub const fn output_map_fpuniv(i: usize) -> usize {
    0x440 + 2 * i
}
/// Rear transition-module output `i` source map (16-bit).
#[must_use]
pub const fn output_map_rb(i: usize) -> usize {
    0x480 + 2 * i
}

/// Front-panel input `i` control register.
#[must_use]
pub const fn input_ctrl(i: usize) -> usize {
    0x500 + 4 * i
}

/// CML output `i` control register.
#[must_use]
pub const fn cml_ctrl(i: usize) -> usize {
    0x600 + 0x20 * i
}
/// CML output `i` classic-mode pattern word `w` (rising/high/falling/low).
#[must_use]
pub const fn cml_pattern(i: usize, w: usize) -> usize {
    0x604 + 0x20 * i + 4 * w
}
/// CML output `i` frequency-mode high count (16-bit).
#[must_use]
pub const fn cml_count_high(i: usize) -> usize {
    0x614 + 0x20 * i
}
/// CML output `i` frequency-mode low count (16-bit).
#[must_use]
pub const fn cml_count_low(i: usize) -> usize {
    0x616 + 0x20 * i
}
/// CML output `i` pattern-mode waveform RAM.
#[must_use]
pub const fn cml_pattern_ram(i: usize) -> usize {
    0x2_0000 + 0x4000 * i
}

/// Longest pattern-mode waveform, in 32-bit words.
pub const CML_PATTERN_MAX: usize = 2048;

// ── Data buffer windows ──────────────────────────────────────────────────────

/// Receive data-buffer window base (2 KB, word-accessed).
pub const DATA_RX_BASE: usize = 0x800;
/// Transmit data-buffer window base (2 KB, word-accessed).
pub const DATA_TX_BASE: usize = 0x1800;

// ── Mapping RAM ──────────────────────────────────────────────────────────────

/// Words of one mapping-RAM row.
pub mod map_word {
    /// Special-action word (FIFO save, latch, heartbeat reset, …).
    pub const INTERNAL: usize = 0;
    /// Pulser trigger selects.
    pub const TRIGGER: usize = 1;
    /// Pulser set selects.
    pub const SET: usize = 2;
    /// Pulser reset selects.
    pub const RESET: usize = 3;
}

/// Mapping RAM `ram` (0 or 1), row `code`, word `word`.
#[must_use]
pub const fn mapping_ram(ram: usize, code: usize, word: usize) -> usize {
    0x5000 + ram * 0x1000 + code * 16 + word * 4
}

/// Special action functions live in bits 96..=127 of a row, i.e. the
/// `INTERNAL` word. Function numbers are the global bit positions.
pub mod action {
    /// First special function number.
    pub const SPECIAL_FIRST: u32 = 96;
    /// Last special function number.
    pub const SPECIAL_LAST: u32 = 127;
    /// Reserved hole in the special range (no hardware behind these bits).
    pub const SPECIAL_HOLE: core::ops::RangeInclusive<u32> = 102..=121;
    /// Save the event to the FIFO with its timestamp.
    pub const FIFO_SAVE: u32 = 127;
    /// Latch the timestamp. Not exposed for software mapping; the latch is
    /// driven from the control register instead (the hardware gives no
    /// status bit to arbitrate both paths).
    pub const LATCH_TS: u32 = 126;
    /// Blink an LED on the front panel.
    pub const LED_BLINK: u32 = 125;
    /// Forward the event on the downstream link.
    pub const FORWARD: u32 = 124;
    /// Stop logging events.
    pub const LOG_STOP: u32 = 123;
    /// Log the event.
    pub const LOG_SAVE: u32 = 122;
    /// Reset the heartbeat timeout counter.
    pub const HEARTBEAT: u32 = 101;
    /// Reset the prescalers.
    pub const RESET_PS: u32 = 100;
    /// Increment the timestamp counter.
    pub const TS_COUNT: u32 = 99;
    /// Reset the timestamp counter.
    pub const TS_RESET: u32 = 98;
    /// Latch the seconds shift register (seconds tick).
    pub const SECONDS_COUNT: u32 = 97;
    /// Reset the seconds counter.
    pub const SECONDS_RESET: u32 = 96;
}

// ── Bit definitions ──────────────────────────────────────────────────────────

/// `STATUS` bits.
pub mod status {
    /// Link violation / loss-of-signal latch.
    pub const LEGVIO: u32 = 1 << 16;
    /// Distributed-bus sample, bits 31:24.
    pub const DBUS_MASK: u32 = 0xFF00_0000;
    /// Shift for `DBUS_MASK`.
    pub const DBUS_SHIFT: u32 = 24;
}

/// `CONTROL` bits.
pub mod control {
    /// Master enable for event reception.
    pub const ENABLE: u32 = 1 << 31;
    /// Forward received events downstream.
    pub const EVTFWD: u32 = 1 << 30;
    /// Use distributed-bus bit 4 as the timestamp clock.
    pub const TSDBUS: u32 = 1 << 14;
    /// Reset the timestamp counters.
    pub const TSRST: u32 = 1 << 13;
    /// Latch the live timestamp into `TS_SEC_LATCH`/`TS_EVT_LATCH`.
    pub const TSLTCH: u32 = 1 << 10;
    /// Enable the mapping RAM.
    pub const MAPENA: u32 = 1 << 9;
    /// Select mapping RAM 1 instead of 0.
    pub const MAPSEL: u32 = 1 << 8;
    /// Reset the event FIFO.
    pub const FIFORST: u32 = 1 << 3;
}

/// `IRQ_FLAG` / `IRQ_ENABLE` cause bits.
pub mod irq {
    /// Receiver error (link down, CRC violation).
    pub const RXERR: u32 = 0x01;
    /// Event FIFO overflowed.
    pub const FIFOFULL: u32 = 0x02;
    /// Heartbeat timeout.
    pub const HEARTBEAT: u32 = 0x04;
    /// Event FIFO not empty.
    pub const EVENT: u32 = 0x08;
    /// Hardware-mapped action fired.
    pub const HWMAPPED: u32 = 0x10;
    /// Data buffer reception complete.
    pub const BUFFULL: u32 = 0x20;
    /// Link state changed.
    pub const LINKCHG: u32 = 0x40;
    /// Master interrupt enable (`IRQ_ENABLE` only).
    pub const MASTER: u32 = 1 << 31;
}

/// `DATA_BUF_CTRL` / `DATA_TX_CTRL` bits, shared with the EVG DBCR.
pub mod dbcr {
    /// Transfer length mask, bytes, bits 11:0.
    pub const LEN_MASK: u32 = 0x0FFF;
    /// Share the link between DBus and data transmission.
    pub const MODE: u32 = 1 << 16;
    /// Enable the data buffer engine.
    pub const ENA: u32 = 1 << 17;
    /// Trigger a transmission.
    pub const TRIG: u32 = 1 << 18;
    /// Transmission running. RO.
    pub const TXRUN: u32 = 1 << 19;
    /// Transmission complete. RO.
    pub const TXCPT: u32 = 1 << 20;
    /// Reception complete / buffer ready. RO, receive register only.
    pub const RXRDY: u32 = 1 << 14;
    /// Checksum error on reception. RO, receive register only.
    pub const RXSUM_ERR: u32 = 1 << 13;
}

/// `FW_VERSION` fields.
pub mod fw {
    /// Card type, bits 31:28. EVRs read 0x1.
    pub const TYPE_MASK: u32 = 0xF000_0000;
    /// Shift for `TYPE_MASK`.
    pub const TYPE_SHIFT: u32 = 28;
    /// Card type value for an EVR.
    pub const TYPE_EVR: u32 = 0x1;
    /// Card type value for an EVG.
    pub const TYPE_EVG: u32 = 0x2;
    /// Form factor, bits 27:24.
    pub const FORM_MASK: u32 = 0x0F00_0000;
    /// Shift for `FORM_MASK`.
    pub const FORM_SHIFT: u32 = 24;
    /// Firmware revision, bits 7:0.
    pub const VER_MASK: u32 = 0x0000_00FF;
    /// Oldest firmware revision the driver understands.
    pub const MIN_VERSION: u32 = 3;
}

/// `CLK_CTRL` bits.
pub mod clk_ctrl {
    /// Event-clock PLL locked. RO.
    pub const CGLOCK: u32 = 1 << 9;
}

/// Pulser control bits.
pub mod pulser {
    /// Drive the output.
    pub const ENABLE: u32 = 1 << 0;
    /// Invert the output.
    pub const POLARITY: u32 = 1 << 1;
    /// Gate this pulser by pulse mask `id` (0..=3).
    #[must_use]
    pub const fn mask_gate(id: u32) -> u32 {
        1 << (28 + id)
    }
    /// Number of pulse-mask gates.
    pub const NUM_MASKS: u32 = 4;
}

/// Front-panel input control bits.
pub mod input {
    /// Event code injected upstream on an edge, bits 7:0.
    pub const EXT_CODE_MASK: u32 = 0x0000_00FF;
    /// Level-sensitive instead of edge-sensitive.
    pub const LEVEL: u32 = 1 << 8;
    /// Invert the input sense.
    pub const POLARITY: u32 = 1 << 9;
    /// Distributed-bus bits driven by this input, bits 23:16.
    pub const DBUS_MASK: u32 = 0x00FF_0000;
    /// Shift for `DBUS_MASK`.
    pub const DBUS_SHIFT: u32 = 16;
}

/// Output source-map codes (u16 map registers).
pub mod output_map {
    /// Highest mappable source code.
    pub const SOURCE_MAX: u16 = 63;
    /// Force the output low.
    pub const FORCE_LOW: u16 = 63;
    /// Force the output high.
    pub const FORCE_HIGH: u16 = 62;
}

/// CML output `i` pattern-mode waveform length (16-bit, words).
#[must_use]
pub const fn cml_pattern_len(i: usize) -> usize {
    0x618 + 0x20 * i
}

/// CML output control bits.
pub mod cml {
    /// Power up and drive the output.
    pub const ENABLE: u32 = 1 << 0;
    /// Hold the serializer in reset.
    pub const RESET: u32 = 1 << 1;
    /// Power down the output stage.
    pub const POWER_DOWN: u32 = 1 << 2;
    /// Mode select, bits 5:4 (`MODE_*` values pre-shifted).
    pub const MODE_MASK: u32 = 0x30;
    /// Four-word rising/high/falling/low patterns.
    pub const MODE_CLASSIC: u32 = 0x00;
    /// Square wave from high/low tick counts.
    pub const MODE_FREQ: u32 = 0x10;
    /// Arbitrary waveform from the pattern RAM.
    pub const MODE_PATTERN: u32 = 0x20;
    /// Frequency-mode output polarity.
    pub const FREQ_POL: u32 = 1 << 6;
    /// Bits of one pattern word actually serialized per event-clock cycle.
    pub const PATTERN_WORD_BITS: u32 = 20;
    /// Mask of the valid bits of a pattern word.
    pub const PATTERN_WORD_MASK: u32 = (1 << 20) - 1;
}

/// Card form factors reported in `FW_VERSION`.
pub mod form {
    /// CompactPCI, 3U.
    pub const CPCI: u32 = 0x0;
    /// PMC mezzanine.
    pub const PMC: u32 = 0x1;
    /// VME64x.
    pub const VME64: u32 = 0x2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_registers_do_not_overlap() {
        assert_ne!(STATUS, CONTROL);
        assert_ne!(IRQ_FLAG, IRQ_ENABLE);
        assert_ne!(DATA_BUF_CTRL, DATA_TX_CTRL);
        assert_eq!(DATA_BUF_CTRL, 0x20);
        assert_eq!(DATA_TX_CTRL, 0x24);
        assert_eq!(FW_VERSION, 0x2C);
    }

    #[test]
    fn mapping_ram_row_addressing() {
        assert_eq!(mapping_ram(0, 0, map_word::INTERNAL), 0x5000);
        assert_eq!(mapping_ram(0, 1, map_word::INTERNAL), 0x5010);
        assert_eq!(mapping_ram(0, 10, map_word::TRIGGER), 0x5000 + 160 + 4);
        assert_eq!(mapping_ram(1, 0, map_word::INTERNAL), 0x6000);
        // Row 255 of RAM 1 stays inside the second RAM's 4 KB block.
        assert!(mapping_ram(1, 255, map_word::RESET) < 0x7000);
    }

    #[test]
    fn fifo_save_is_top_bit_of_internal_word() {
        assert_eq!(action::FIFO_SAVE % 32, 31);
        assert_eq!(action::LATCH_TS % 32, 30);
    }

    #[test]
    fn data_windows_fit_2k() {
        assert!(DATA_RX_BASE + 2048 <= DATA_TX_BASE);
        assert!(DATA_TX_BASE + 2048 <= mapping_ram(0, 0, 0));
    }
}
