//! Software-simulated EVR/EVG card.
//!
//! Implements [`RegIo`] over a shadow register file plus just enough
//! behavioral state to exercise the driver end-to-end: FIFO pop-on-read,
//! write-one-to-clear interrupt flags, timestamp latching, FIFO reset,
//! sequence-RAM arming and data-buffer transmission capture. The entire
//! driver stack — mapping RAM, drain loop, timestamp engine, sequencer,
//! data buffers — runs against this without hardware, which is how CI and
//! the scenario tests work.
//!
//! Card memory is kept in wire byte order (big-endian words), matching
//! what a real card holds behind the window's per-word reversal.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mrf_chip::{evg, evr};

use crate::io::RegIo;

/// Which card personality the simulator presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Event receiver.
    Evr,
    /// Event generator.
    Evg,
}

const EVR_LEN: usize = 0x3_0000;
const EVG_LEN: usize = 0x1_0000;

struct SimState {
    regs: Vec<u8>,
    fifo: VecDeque<(u8, u32, u32)>,
    link_down: bool,
    glitch_armed: bool,
    last_tx: Option<Vec<u8>>,
    writes: HashMap<usize, u32>,
}

/// Simulated card. Construct with [`SimCard::evr`] or [`SimCard::evg`].
pub struct SimCard {
    kind: SimKind,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCard").field("kind", &self.kind).finish()
    }
}

impl SimCard {
    /// New simulated EVR with a plausible firmware signature.
    #[must_use]
    pub fn evr() -> Self {
        let card = Self::blank(SimKind::Evr, EVR_LEN);
        card.poke32(
            evr::FW_VERSION,
            (evr::fw::TYPE_EVR << evr::fw::TYPE_SHIFT) | (evr::form::VME64 << evr::fw::FORM_SHIFT) | 6,
        );
        card
    }

    /// New simulated EVG with a plausible firmware signature.
    #[must_use]
    pub fn evg() -> Self {
        let card = Self::blank(SimKind::Evg, EVG_LEN);
        card.poke32(
            evg::FW_VERSION,
            (evr::fw::TYPE_EVG << evr::fw::TYPE_SHIFT) | (evr::form::VME64 << evr::fw::FORM_SHIFT) | 6,
        );
        card
    }

    fn blank(kind: SimKind, len: usize) -> Self {
        Self {
            kind,
            state: Mutex::new(SimState {
                regs: vec![0u8; len],
                fifo: VecDeque::new(),
                link_down: false,
                glitch_armed: false,
                last_tx: None,
                writes: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Test-harness controls (not part of RegIo) ───────────────────────

    /// Push an event into the hardware FIFO and raise the `EVENT` cause.
    /// A full FIFO drops the entry and raises `FIFOFULL` instead.
    pub fn push_fifo(&self, code: u8, sec: u32, evt: u32) {
        let mut st = self.lock();
        if st.fifo.len() >= evr::EVT_FIFO_DEPTH {
            or32(&mut st.regs, evr::IRQ_FLAG, evr::irq::FIFOFULL);
            return;
        }
        st.fifo.push_back((code, sec, evt));
        or32(&mut st.regs, evr::IRQ_FLAG, evr::irq::EVENT);
    }

    /// Assert or clear the receiver-error condition. While down, the
    /// `RXERR` cause re-latches immediately after every W1C.
    pub fn set_link_down(&self, down: bool) {
        let mut st = self.lock();
        st.link_down = down;
        if down {
            or32(&mut st.regs, evr::IRQ_FLAG, evr::irq::RXERR);
        }
    }

    /// Latch extra interrupt-cause bits, as the hardware would.
    pub fn raise_irq(&self, mask: u32) {
        or32(&mut self.lock().regs, evr::IRQ_FLAG, mask);
    }

    /// Arm the known control-register corruption: the next write that
    /// clears the timestamp-latch bit lands with a spurious bit set.
    pub fn arm_control_glitch(&self) {
        self.lock().glitch_armed = true;
    }

    /// Bytes of the last transmitted data-buffer frame, wire order.
    #[must_use]
    pub fn last_tx_frame(&self) -> Option<Vec<u8>> {
        self.lock().last_tx.clone()
    }

    /// Deposit a received frame in the RX window and raise `BUFFULL`.
    /// `wire` is the raw link frame starting with the protocol id.
    pub fn load_rx_frame(&self, wire: &[u8]) {
        assert_eq!(self.kind, SimKind::Evr, "only receivers have an RX buffer");
        assert!(wire.len() <= 2048, "frame longer than the data buffer");
        let mut st = self.lock();
        let base = evr::DATA_RX_BASE;
        st.regs[base..base + wire.len()].copy_from_slice(wire);
        let dbcr = evr::dbcr::RXRDY | (wire.len() as u32 & evr::dbcr::LEN_MASK);
        put32(&mut st.regs, evr::DATA_BUF_CTRL, dbcr);
        or32(&mut st.regs, evr::IRQ_FLAG, evr::irq::BUFFULL);
    }

    /// Disarm a sequence RAM and raise its stop cause, as the hardware
    /// does when single-shot playback reaches the terminator.
    pub fn complete_sequence(&self, slot: usize) {
        assert_eq!(self.kind, SimKind::Evg);
        let mut st = self.lock();
        let off = evg::seq_ctrl(slot);
        let v = get32(&st.regs, off) & !(evg::seq_ctrl::ENABLED | evg::seq_ctrl::RUNNING);
        put32(&mut st.regs, off, v);
        or32(&mut st.regs, evg::IRQ_FLAG, evg::irq::seq_stop(slot));
    }

    /// Raw register read bypassing all behavior.
    #[must_use]
    pub fn peek32(&self, offset: usize) -> u32 {
        get32(&self.lock().regs, offset)
    }

    /// Raw register write bypassing all behavior and write accounting.
    pub fn poke32(&self, offset: usize, value: u32) {
        put32(&mut self.lock().regs, offset, value);
    }

    /// How many times the driver wrote any width at `offset`.
    #[must_use]
    pub fn write_count(&self, offset: usize) -> u32 {
        self.lock().writes.get(&offset).copied().unwrap_or(0)
    }

    /// One decoded sequence-RAM row.
    #[must_use]
    pub fn seq_ram_row(&self, slot: usize, row: usize) -> (u8, u32) {
        let st = self.lock();
        let ts = get32(&st.regs, evg::seq_ram_ts(slot, row));
        let code = get32(&st.regs, evg::seq_ram_code(slot, row)) as u8;
        (code, ts)
    }

    // ── Behavioral register handling ────────────────────────────────────

    fn read32_inner(&self, offset: usize) -> u32 {
        let mut st = self.lock();
        match (self.kind, offset) {
            (SimKind::Evr, evr::IRQ_FLAG) => {
                let mut v = get32(&st.regs, offset);
                if !st.fifo.is_empty() {
                    v |= evr::irq::EVENT;
                }
                if st.fifo.len() >= evr::EVT_FIFO_DEPTH {
                    v |= evr::irq::FIFOFULL;
                }
                if st.link_down {
                    v |= evr::irq::RXERR;
                }
                v
            }
            (SimKind::Evr, evr::EVT_FIFO_CODE) => match st.fifo.pop_front() {
                Some((code, sec, evt)) => {
                    put32(&mut st.regs, evr::EVT_FIFO_SEC, sec);
                    put32(&mut st.regs, evr::EVT_FIFO_EVT, evt);
                    if st.fifo.is_empty() {
                        and32(&mut st.regs, evr::IRQ_FLAG, !evr::irq::EVENT);
                    }
                    u32::from(code)
                }
                None => 0,
            },
            _ => get32(&st.regs, offset),
        }
    }

    fn write32_inner(&self, offset: usize, value: u32) {
        let mut st = self.lock();
        *st.writes.entry(offset).or_insert(0) += 1;
        match (self.kind, offset) {
            (_, off) if off == evr::IRQ_FLAG => {
                // Write-one-to-clear.
                and32(&mut st.regs, evr::IRQ_FLAG, !value);
            }
            (SimKind::Evr, evr::CONTROL) => {
                let prev = get32(&st.regs, evr::CONTROL);
                let mut v = value;
                if v & evr::control::FIFORST != 0 {
                    st.fifo.clear();
                    and32(
                        &mut st.regs,
                        evr::IRQ_FLAG,
                        !(evr::irq::EVENT | evr::irq::FIFOFULL),
                    );
                    v &= !evr::control::FIFORST;
                }
                if v & evr::control::TSLTCH != 0 && prev & evr::control::TSLTCH == 0 {
                    let sec = get32(&st.regs, evr::TS_SEC);
                    let evt = get32(&st.regs, evr::TS_EVT);
                    put32(&mut st.regs, evr::TS_SEC_LATCH, sec);
                    put32(&mut st.regs, evr::TS_EVT_LATCH, evt);
                }
                if prev & evr::control::TSLTCH != 0
                    && v & evr::control::TSLTCH == 0
                    && st.glitch_armed
                {
                    st.glitch_armed = false;
                    v |= evr::control::MAPSEL;
                }
                put32(&mut st.regs, evr::CONTROL, v);
            }
            (SimKind::Evr, evr::DATA_TX_CTRL) | (SimKind::Evg, evg::DATA_BUF_CTRL) => {
                let mut v = value;
                if v & evr::dbcr::TRIG != 0 {
                    let base = match self.kind {
                        SimKind::Evr => evr::DATA_TX_BASE,
                        SimKind::Evg => evg::DATA_TX_BASE,
                    };
                    let len = (v & evr::dbcr::LEN_MASK) as usize;
                    st.last_tx = Some(st.regs[base..base + len].to_vec());
                    v = (v & !(evr::dbcr::TRIG | evr::dbcr::TXRUN)) | evr::dbcr::TXCPT;
                }
                put32(&mut st.regs, offset, v);
            }
            (SimKind::Evg, off)
                if off == evg::seq_ctrl(0) || off == evg::seq_ctrl(1) =>
            {
                let prev = get32(&st.regs, off);
                let ro = prev & (evg::seq_ctrl::ENABLED | evg::seq_ctrl::RUNNING);
                let mut v = (value & !(evg::seq_ctrl::ENABLED | evg::seq_ctrl::RUNNING)) | ro;
                if v & evg::seq_ctrl::ENABLE != 0 {
                    v = (v & !evg::seq_ctrl::ENABLE) | evg::seq_ctrl::ENABLED;
                }
                if v & evg::seq_ctrl::DISABLE != 0 {
                    v &= !(evg::seq_ctrl::DISABLE
                        | evg::seq_ctrl::ENABLED
                        | evg::seq_ctrl::RUNNING);
                }
                if v & evg::seq_ctrl::SW_TRIG != 0 {
                    v = (v & !evg::seq_ctrl::SW_TRIG) | evg::seq_ctrl::RUNNING;
                }
                v &= !evg::seq_ctrl::RESET;
                put32(&mut st.regs, off, v);
            }
            _ => put32(&mut st.regs, offset, value),
        }
    }
}

impl RegIo for SimCard {
    fn read8(&self, offset: usize) -> u8 {
        self.lock().regs[offset]
    }

    fn write8(&self, offset: usize, value: u8) {
        let mut st = self.lock();
        *st.writes.entry(offset).or_insert(0) += 1;
        st.regs[offset] = value;
    }

    fn read16(&self, offset: usize) -> u16 {
        let st = self.lock();
        u16::from_be_bytes([st.regs[offset], st.regs[offset + 1]])
    }

    fn write16(&self, offset: usize, value: u16) {
        let mut st = self.lock();
        *st.writes.entry(offset).or_insert(0) += 1;
        st.regs[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read32_inner(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write32_inner(offset, value);
    }

    fn len(&self) -> usize {
        match self.kind {
            SimKind::Evr => EVR_LEN,
            SimKind::Evg => EVG_LEN,
        }
    }
}

fn get32(regs: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        regs[offset],
        regs[offset + 1],
        regs[offset + 2],
        regs[offset + 3],
    ])
}

fn put32(regs: &mut [u8], offset: usize, value: u32) {
    regs[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn or32(regs: &mut [u8], offset: usize, mask: u32) {
    let v = get32(regs, offset);
    put32(regs, offset, v | mask);
}

fn and32(regs: &mut [u8], offset: usize, mask: u32) {
    let v = get32(regs, offset);
    put32(regs, offset, v & mask);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_pops_on_code_read() {
        let card = SimCard::evr();
        card.push_fifo(10, 0x6000_0001, 0x1234_5678);
        assert_ne!(card.read32(evr::IRQ_FLAG) & evr::irq::EVENT, 0);

        assert_eq!(card.read32(evr::EVT_FIFO_CODE), 10);
        assert_eq!(card.read32(evr::EVT_FIFO_SEC), 0x6000_0001);
        assert_eq!(card.read32(evr::EVT_FIFO_EVT), 0x1234_5678);

        assert_eq!(card.read32(evr::EVT_FIFO_CODE), 0);
        assert_eq!(card.read32(evr::IRQ_FLAG) & evr::irq::EVENT, 0);
    }

    #[test]
    fn irq_flag_is_write_one_to_clear() {
        let card = SimCard::evr();
        card.raise_irq(evr::irq::HEARTBEAT | evr::irq::BUFFULL);
        card.write32(evr::IRQ_FLAG, evr::irq::HEARTBEAT);
        assert_eq!(
            card.read32(evr::IRQ_FLAG) & (evr::irq::HEARTBEAT | evr::irq::BUFFULL),
            evr::irq::BUFFULL
        );
    }

    #[test]
    fn rxerr_relatches_while_link_down() {
        let card = SimCard::evr();
        card.set_link_down(true);
        card.write32(evr::IRQ_FLAG, evr::irq::RXERR);
        assert_ne!(card.read32(evr::IRQ_FLAG) & evr::irq::RXERR, 0);
        card.set_link_down(false);
        card.write32(evr::IRQ_FLAG, evr::irq::RXERR);
        assert_eq!(card.read32(evr::IRQ_FLAG) & evr::irq::RXERR, 0);
    }

    #[test]
    fn control_latch_copies_timestamp() {
        let card = SimCard::evr();
        card.poke32(evr::TS_SEC, 0x6000_0000);
        card.poke32(evr::TS_EVT, 42);
        card.write32(evr::CONTROL, evr::control::TSLTCH);
        assert_eq!(card.read32(evr::TS_SEC_LATCH), 0x6000_0000);
        assert_eq!(card.read32(evr::TS_EVT_LATCH), 42);
    }

    #[test]
    fn fiforst_clears_fifo() {
        let card = SimCard::evr();
        card.push_fifo(5, 1, 2);
        card.write32(evr::CONTROL, evr::control::FIFORST);
        assert_eq!(card.read32(evr::EVT_FIFO_CODE), 0);
        assert_eq!(card.read32(evr::CONTROL) & evr::control::FIFORST, 0);
    }

    #[test]
    fn tx_trigger_captures_frame() {
        let card = SimCard::evg();
        card.write32(evg::DATA_TX_BASE, 0xDEAD_BEEF);
        card.write32(evg::DATA_TX_BASE + 4, 0xAABB_CCDD);
        card.write32(
            evg::DATA_BUF_CTRL,
            evr::dbcr::ENA | evr::dbcr::MODE | evr::dbcr::TRIG | 8,
        );
        let frame = card.last_tx_frame().expect("captured frame");
        assert_eq!(frame, [0xDE, 0xAD, 0xBE, 0xEF, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_ne!(card.read32(evg::DATA_BUF_CTRL) & evr::dbcr::TXCPT, 0);
    }

    #[test]
    fn sequence_arm_and_complete() {
        let card = SimCard::evg();
        card.write32(evg::seq_ctrl(0), evg::seq_ctrl::SINGLE | evg::seq_ctrl::ENABLE);
        assert_ne!(card.read32(evg::seq_ctrl(0)) & evg::seq_ctrl::ENABLED, 0);
        card.complete_sequence(0);
        assert_eq!(card.read32(evg::seq_ctrl(0)) & evg::seq_ctrl::ENABLED, 0);
        assert_ne!(card.read32(evg::IRQ_FLAG) & evg::irq::seq_stop(0), 0);
    }
}
