//! Distributed data buffer: framed 2 KB transmit/receive over the link.
//!
//! The wire frame is a 4-byte protocol id in network byte order followed
//! by up to 2044 payload bytes, the total rounded up to a multiple of 4.
//! Card memory behind the window is big-endian, so the staging copy moves
//! 32-bit words through the window and the per-word reversal happens
//! there, never here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mrf_chip::evr::dbcr;

use crate::error::{MrfError, Result};
use crate::io::RegWindow;
use crate::work::Scan;

/// Total buffer size in bytes.
pub const BUF_LEN: usize = 2048;
/// Bytes reserved for the protocol id at the head of the frame.
pub const PROTO_LEN: usize = 4;

const BUF_WORDS: usize = BUF_LEN / 4;

struct TxState {
    stage: Box<[u32; BUF_WORDS]>,
    /// High-water mark: next multiple of 4 at or above the last written byte.
    hwm: usize,
}

/// Transmit side of the data buffer (EVR upstream port or EVG).
pub struct DataBufTx {
    win: RegWindow,
    base: usize,
    ctrl: usize,
    proto: AtomicU32,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for DataBufTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBufTx")
            .field("proto", &self.proto.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataBufTx {
    /// New transmitter over `base` (2 KB window) controlled by `ctrl`.
    #[must_use]
    pub fn new(win: RegWindow, base: usize, ctrl: usize, proto: u32) -> Self {
        Self {
            win,
            base,
            ctrl,
            proto: AtomicU32::new(proto),
            state: Mutex::new(TxState {
                stage: Box::new([0u32; BUF_WORDS]),
                hwm: PROTO_LEN,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the transmitted protocol id.
    pub fn set_protocol(&self, proto: u32) {
        self.proto.store(proto, Ordering::Relaxed);
    }

    /// Currently configured protocol id.
    #[must_use]
    pub fn protocol(&self) -> u32 {
        self.proto.load(Ordering::Relaxed)
    }

    /// Stage payload bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Offsets in `[0, 4)` belong to the protocol id and are rejected, as
    /// is anything running past the end of the buffer.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset < PROTO_LEN || offset + data.len() > BUF_LEN {
            return Err(MrfError::BufferBounds {
                offset,
                len: data.len(),
                low: PROTO_LEN,
                high: BUF_LEN,
            });
        }
        let mut st = self.lock();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut st.stage[..]);
        bytes[offset..offset + data.len()].copy_from_slice(data);
        st.hwm = (offset + data.len() + 3) & !3;
        Ok(())
    }

    /// Copy the staged frame to the card and trigger transmission.
    pub fn flush(&self) {
        let proto = self.proto.load(Ordering::Relaxed);
        let mut st = self.lock();

        {
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut st.stage[..]);
            bytes[..PROTO_LEN].copy_from_slice(&proto.to_be_bytes());
        }

        let len = st.hwm.max(PROTO_LEN);
        for (i, &word) in st.stage[..len / 4].iter().enumerate() {
            // Stage words hold wire (big-endian) bytes; the window expects
            // natural values and performs its own reversal.
            self.win.write32(self.base + 4 * i, u32::from_be(word));
        }

        let dbcr = dbcr::ENA | dbcr::MODE | dbcr::TRIG | (len as u32 & dbcr::LEN_MASK);
        self.win.write32(self.ctrl, 0);
        self.win.write32(self.ctrl, dbcr);

        let status = self.win.read32(self.ctrl);
        tracing::debug!(
            len,
            proto = format_args!("{proto:#010x}"),
            complete = status & dbcr::TXCPT != 0,
            running = status & dbcr::TXRUN != 0,
            "data buffer flushed"
        );
    }
}

struct RxState {
    shadow: Box<[u8; BUF_LEN]>,
    len: usize,
}

/// Receive side of the data buffer (EVR only).
pub struct DataBufRx {
    win: RegWindow,
    base: usize,
    ctrl: usize,
    irq_enable: usize,
    irq_cause: u32,
    filter: AtomicU32,
    state: Mutex<RxState>,
    scan: Arc<Scan>,
    count_dropped: AtomicU32,
}

impl std::fmt::Debug for DataBufRx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBufRx")
            .field("filter", &self.filter.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataBufRx {
    /// New receiver over `base`, re-enabling `irq_cause` in `irq_enable`
    /// after each drained frame. `filter` 0 accepts any protocol.
    #[must_use]
    pub fn new(
        win: RegWindow,
        base: usize,
        ctrl: usize,
        irq_enable: usize,
        irq_cause: u32,
        filter: u32,
    ) -> Self {
        Self {
            win,
            base,
            ctrl,
            irq_enable,
            irq_cause,
            filter: AtomicU32::new(filter),
            state: Mutex::new(RxState {
                shadow: Box::new([0u8; BUF_LEN]),
                len: 0,
            }),
            scan: Scan::new(),
            count_dropped: AtomicU32::new(0),
        }
    }

    /// Change the protocol filter; 0 accepts any id.
    pub fn set_filter(&self, filter: u32) {
        self.filter.store(filter, Ordering::Relaxed);
    }

    /// Current protocol filter.
    #[must_use]
    pub fn filter(&self) -> u32 {
        self.filter.load(Ordering::Relaxed)
    }

    /// Scan point fired when a frame passes the filter.
    #[must_use]
    pub fn scan(&self) -> &Arc<Scan> {
        &self.scan
    }

    /// Frames dropped by the protocol filter.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.count_dropped.load(Ordering::Relaxed)
    }

    /// Pull the received frame out of the card window and dispatch it.
    /// Runs on the medium-priority worker after a buffer-full interrupt;
    /// reception and the interrupt cause are re-armed afterwards.
    pub fn drain(&self) {
        let status = self.win.read32(self.ctrl);
        let len = (status & dbcr::LEN_MASK) as usize;

        if len >= PROTO_LEN && len <= BUF_LEN {
            let mut wire = [0u8; BUF_LEN];
            for i in 0..len.div_ceil(4) {
                let w = self.win.read32(self.base + 4 * i);
                wire[4 * i..4 * i + 4].copy_from_slice(&w.to_be_bytes());
            }
            self.receive(wire[0], &wire[1..len]);
        } else if len != 0 {
            tracing::warn!(len, "data buffer reported nonsense length, frame skipped");
        }

        let _irq = self.win.lock_irq();
        let v = self.win.read32(self.ctrl);
        self.win
            .write32(self.ctrl, (v & !dbcr::LEN_MASK) | dbcr::ENA);
        let e = self.win.read32(self.irq_enable);
        self.win.write32(self.irq_enable, e | self.irq_cause);
    }

    /// Dispatch one received frame. `proto` is the first wire byte, the
    /// payload follows it (so the protocol id spans both arguments).
    pub fn receive(&self, proto: u8, payload: &[u8]) {
        if payload.len() < 3 {
            tracing::warn!(len = payload.len(), "runt data-buffer frame dropped");
            return;
        }
        let id = u32::from_be_bytes([proto, payload[0], payload[1], payload[2]]);

        let filter = self.filter.load(Ordering::Relaxed);
        if filter != 0 && filter != id {
            self.count_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                got = format_args!("{id:#010x}"),
                want = format_args!("{filter:#010x}"),
                "protocol filter dropped frame"
            );
            return;
        }

        {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.shadow[0] = proto;
            st.shadow[1..=payload.len()].copy_from_slice(payload);
            st.len = 1 + payload.len();
        }

        self.scan.request();
    }

    /// Copy received payload bytes at `offset` into `out`.
    ///
    /// # Errors
    ///
    /// Offsets in `[0, 4)` hold the protocol id and are rejected; reads
    /// past the received length fail too.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if offset < PROTO_LEN || offset + out.len() > st.len {
            return Err(MrfError::BufferBounds {
                offset,
                len: out.len(),
                low: PROTO_LEN,
                high: st.len,
            });
        }
        out.copy_from_slice(&st.shadow[offset..offset + out.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RegIo;
    use crate::sim::SimCard;
    use mrf_chip::evr;
    use std::sync::Arc;

    fn tx_over_sim() -> (Arc<SimCard>, DataBufTx) {
        let sim = Arc::new(SimCard::evr());
        let win = RegWindow::new(Arc::clone(&sim) as Arc<dyn RegIo>);
        let tx = DataBufTx::new(win, evr::DATA_TX_BASE, evr::DATA_TX_CTRL, 0xDEAD_BEEF);
        (sim, tx)
    }

    #[test]
    fn protocol_id_leads_the_frame_big_endian() {
        let (sim, tx) = tx_over_sim();
        tx.write(4, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        tx.flush();
        let frame = sim.last_tx_frame().unwrap();
        assert_eq!(frame, [0xDE, 0xAD, 0xBE, 0xEF, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn length_rounds_up_to_words() {
        let (sim, tx) = tx_over_sim();
        tx.write(4, &[1, 2, 3]).unwrap();
        tx.flush();
        assert_eq!(sim.last_tx_frame().unwrap().len(), 8);
    }

    #[test]
    fn writes_below_proto_or_past_end_rejected() {
        let (_sim, tx) = tx_over_sim();
        assert!(tx.write(0, &[0]).is_err());
        assert!(tx.write(3, &[0]).is_err());
        assert!(tx.write(2046, &[0, 0, 0]).is_err());
        assert!(tx.write(4, &[0; 2045]).is_err());
        assert!(tx.write(2044, &[0; 4]).is_ok());
    }

    fn rx_over_sim(filter: u32) -> DataBufRx {
        let sim = Arc::new(SimCard::evr());
        let win = RegWindow::new(sim as Arc<dyn RegIo>);
        DataBufRx::new(
            win,
            evr::DATA_RX_BASE,
            evr::DATA_BUF_CTRL,
            evr::IRQ_ENABLE,
            evr::irq::BUFFULL,
            filter,
        )
    }

    #[test]
    fn filter_zero_accepts_and_notifies() {
        let rx = rx_over_sim(0);
        rx.receive(0xDE, &[0xAD, 0xBE, 0xEF, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(rx.scan().count(), 1);
        let mut out = [0u8; 4];
        rx.read(4, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn mismatched_filter_drops_silently() {
        let rx = rx_over_sim(0xDEAD_BEE0);
        rx.receive(0xDE, &[0xAD, 0xBE, 0xEF, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(rx.scan().count(), 0);
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn matching_filter_passes() {
        let rx = rx_over_sim(0xDEAD_BEEF);
        rx.receive(0xDE, &[0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(rx.scan().count(), 1);
    }

    #[test]
    fn proto_region_is_unreadable() {
        let rx = rx_over_sim(0);
        rx.receive(0xDE, &[0xAD, 0xBE, 0xEF, 0xAA, 0xBB, 0xCC, 0xDD]);
        let mut out = [0u8; 2];
        assert!(rx.read(0, &mut out).is_err());
        assert!(rx.read(3, &mut out).is_err());
        assert!(rx.read(7, &mut out).is_err());
        assert!(rx.read(6, &mut out).is_ok());
    }
}
