//! Drive a simulated receiver end-to-end: subscribe to an event code,
//! replay a burst of link traffic, and print what the pipeline delivers.
//!
//! ```sh
//! cargo run -p mrf-driver --example evr_monitor
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mrf_driver::prelude::*;
use mrf_driver::sim::SimCard;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let sim = Arc::new(SimCard::evr());
    let evr = Evr::new(
        0,
        Arc::clone(&sim) as Arc<dyn RegIo>,
        &EvrConfig {
            threaded: false,
            fifo_min_period: Duration::ZERO,
            rx_protocol: 0,
        },
    )?;

    evr.enable(true);
    evr.irq_enable(true);
    evr.clock_set(125.0)?;
    evr.clock_ts_set(1e9)?;

    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    evr.subscribe_event(
        10,
        Arc::new(move |ev| {
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::info!(code = ev.code, sec = ev.sec, ticks = ev.evt, "event delivered");
        }),
    )?;

    // Seconds tick first so timestamps validate, then a burst on code 10.
    sim.poke32(mrf_chip::evr::TS_SEC, 0x6000_0001);
    sim.push_fifo(mrf_chip::EVENT_TS_COUNTER_RST, 0x6000_0001, 0);
    for n in 0..5 {
        sim.push_fifo(10, 0x6000_0001, 1_000 * n);
        evr.isr();
        evr.events().drain_fifo_pass();
        evr.engine().pump_all();
    }

    let ts = evr.get_timestamp(10)?;
    println!(
        "delivered {} events; last timestamp {}s + {}ns (epoch 1990)",
        seen.load(Ordering::Relaxed),
        ts.sec,
        ts.nsec
    );
    Ok(())
}
