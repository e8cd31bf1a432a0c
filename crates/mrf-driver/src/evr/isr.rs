//! EVR interrupt dispatcher.
//!
//! A single top-half per card: classify the active causes, disable the
//! level-sensitive ones until their worker re-arms them, hand the work
//! off, acknowledge with a write-one-to-clear, and force the write out
//! with a trailing read.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mrf_chip::evr::{self, irq};

use crate::evr::event::DrainMsg;
use crate::evr::Evr;
use crate::work::Priority;

/// Sink for the trailing flag read; never meaningful, only forces the
/// bus write to complete before the handler returns.
static ISR_FLAGS_TRASH: AtomicU32 = AtomicU32::new(0);

/// Top-half entry. The bus layer installs this against the card's IRQ
/// (for PLX bridges, after clearing the INTx enable in `INTCSR`).
/// Returns whether the card had anything asserted.
pub fn isr(evr: &Evr) -> bool {
    let win = evr.window();

    let flags = win.read32(evr::IRQ_FLAG);
    let enable = win.read32(evr::IRQ_ENABLE);
    let active = flags & enable;

    if active == 0 {
        return false;
    }

    let mut disable = 0u32;

    if active & irq::BUFFULL != 0 {
        // Level sensitive: the RX drain re-enables after emptying.
        disable |= irq::BUFFULL;
        let rx = Arc::clone(evr.buf_rx());
        evr.engine().request(Priority::Medium, Box::new(move || rx.drain()));
        evr.scans().buffer_ready.request();
    }
    if active & irq::HWMAPPED != 0 {
        evr.counters().hardware_irq.fetch_add(1, Ordering::Relaxed);
        evr.scans().mapped_event.request();
    }
    if active & irq::EVENT != 0 {
        // FIFO not empty: the drain thread re-enables when caught up.
        disable |= irq::EVENT;
        evr.wake_drain(DrainMsg::Wake);
    }
    if active & irq::HEARTBEAT != 0 {
        evr.counters().heartbeat.fetch_add(1, Ordering::Relaxed);
        evr.scans().heartbeat.request();
    }
    if active & irq::FIFOFULL != 0 {
        disable |= irq::FIFOFULL;
        evr.wake_drain(DrainMsg::Wake);
        evr.scans().fifo_full.request();
    }
    if active & irq::RXERR != 0 {
        evr.counters().recv_error.fetch_add(1, Ordering::Relaxed);
        evr.scans().rx_error.request();
        // Stays asserted while the link is down; the poll callback owns
        // re-enabling it.
        disable |= irq::RXERR;
        let weak = evr.weak.clone();
        evr.engine().request(
            Priority::Medium,
            Box::new(move || {
                if let Some(evr) = weak.upgrade() {
                    evr.poll_link();
                }
            }),
        );
    }

    {
        let _irq = win.lock_irq();
        let e = win.read32(evr::IRQ_ENABLE);
        win.write32(evr::IRQ_ENABLE, e & !disable);
        win.write32(evr::IRQ_FLAG, flags);
        ISR_FLAGS_TRASH.store(win.read32(evr::IRQ_FLAG), Ordering::Relaxed);
    }

    true
}
