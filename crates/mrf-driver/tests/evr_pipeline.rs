//! End-to-end receiver scenarios over the simulated card: the full
//! subscribe → ISR → drain → notify pipeline, overrate re-arming, link
//! loss, and the glitch-free clock programming contract.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mrf_chip::evr::{self, action, map_word};
use mrf_chip::{fracsynth, EVENT_TS_COUNTER_RST, FRAC_SYNTH_REF_MHZ, POSIX_TIME_AT_EPICS_EPOCH};
use mrf_driver::prelude::*;
use mrf_driver::sim::SimCard;

fn manual_cfg() -> EvrConfig {
    EvrConfig {
        threaded: false,
        fifo_min_period: Duration::ZERO,
        rx_protocol: 0,
    }
}

fn bring_up() -> (Arc<SimCard>, Arc<Evr>) {
    let sim = Arc::new(SimCard::evr());
    let evr = Evr::new(0, Arc::clone(&sim) as Arc<dyn RegIo>, &manual_cfg()).unwrap();
    evr.enable(true);
    evr.irq_enable(true);
    evr.clock_ts_set(1e9).unwrap();
    (sim, evr)
}

/// Deliver a seconds tick carrying `seconds` so the timestamp engine
/// becomes (or stays) valid.
fn seconds_tick(sim: &SimCard, evr: &Arc<Evr>, seconds: u32) {
    sim.poke32(evr::TS_SEC, seconds);
    sim.push_fifo(EVENT_TS_COUNTER_RST, seconds, 0);
    evr.isr();
    evr.events().drain_fifo_pass();
    evr.engine().pump_all();
}

#[test]
fn bad_signature_is_rejected() {
    let sim = Arc::new(SimCard::evr());
    sim.poke32(evr::FW_VERSION, 0);
    assert!(matches!(
        Evr::new(0, sim as Arc<dyn RegIo>, &manual_cfg()),
        Err(MrfError::BadDevice { .. })
    ));
}

#[test]
fn registry_rejects_duplicate_ids() {
    let (_sim, evr) = bring_up();
    let registry = CardRegistry::new();
    registry.register(0, Card::Evr(Arc::clone(&evr))).unwrap();
    assert!(matches!(
        registry.register(0, Card::Evr(Arc::clone(&evr))),
        Err(MrfError::DuplicateId { id: 0 })
    ));
    assert!(registry.get(0).unwrap().as_evr().is_some());
    assert!(matches!(registry.get(7), Err(MrfError::NotFound { id: 7 })));
}

#[test]
fn map_receive_notify() {
    let (sim, evr) = bring_up();
    seconds_tick(&sim, &evr, 0x6000_0001);

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let cb: EventCallback = Arc::new(move |ev| {
        assert_eq!(ev.code, 10);
        assert_eq!(ev.sec, 0x6000_0001);
        assert_eq!(ev.evt, 0x1234_5678);
        c.fetch_add(1, Ordering::Relaxed);
    });
    evr.subscribe_event(10, cb).unwrap();

    sim.push_fifo(10, 0x6000_0001, 0x1234_5678);
    assert!(evr.isr());
    evr.events().drain_fifo_pass();
    evr.engine().pump_all();

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(evr.scan_io(ScanKind::EventOccurred(10)).count(), 1);

    let ts = evr.get_timestamp(10).unwrap();
    assert_eq!(ts.sec, 0x6000_0001 - POSIX_TIME_AT_EPICS_EPOCH);
    assert_eq!(ts.nsec, 0x1234_5678);
}

#[test]
fn fifo_overrun_rearm() {
    let (sim, evr) = bring_up();
    seconds_tick(&sim, &evr, 0x6000_0001);

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    evr.subscribe_event(
        10,
        Arc::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .unwrap();

    let fifo_save_bit = 1 << (action::FIFO_SAVE % 32);
    let internal = evr::mapping_ram(0, 10, map_word::INTERNAL);
    assert_ne!(sim.peek32(internal) & fifo_save_bit, 0);

    // Three back-to-back arrivals before any completion sentinel runs.
    sim.push_fifo(10, 1000, 1);
    sim.push_fifo(10, 1000, 2);
    sim.push_fifo(10, 1000, 3);
    evr.isr();
    evr.events().drain_fifo_pass();

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(evr.events().count_fifo_sw_overrate(), 2);
    // Capture was shed while the slot is saturated.
    assert_eq!(sim.peek32(internal) & fifo_save_bit, 0);

    // Sentinels return: capture is restored and delivery resumes.
    evr.engine().pump_all();
    assert_ne!(sim.peek32(internal) & fifo_save_bit, 0);

    sim.push_fifo(10, 1000, 4);
    evr.isr();
    evr.events().drain_fifo_pass();
    evr.engine().pump_all();
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[test]
fn fifo_overflow_is_counted_and_reset() {
    let (sim, evr) = bring_up();
    for i in 0..600 {
        sim.push_fifo(20, 1, i);
    }
    evr.isr();
    evr.events().drain_fifo_pass();
    evr.engine().pump_all();
    assert_eq!(evr.events().count_fifo_overflow(), 1);
    // Drain re-armed the causes it owns.
    let enabled = sim.peek32(evr::IRQ_ENABLE);
    assert_ne!(enabled & evr::irq::EVENT, 0);
    assert_ne!(enabled & evr::irq::FIFOFULL, 0);
    assert_ne!(enabled & evr::irq::MASTER, 0);
}

#[test]
fn timestamp_invalidation_on_link_loss() {
    let (sim, evr) = bring_up();
    seconds_tick(&sim, &evr, 0x6000_0010);
    let ts_scan = evr.scan_io(ScanKind::TimestampValidChange);
    let transitions = ts_scan.count();

    sim.set_link_down(true);
    assert!(evr.isr());
    assert_eq!(evr.count_recv_error(), 1);

    // First poll entry: validity drops and the scan fires.
    evr.engine().pump_all();
    assert!(!evr.time().valid());
    assert_eq!(ts_scan.count(), transitions + 1);
    assert!(matches!(
        evr.get_timestamp(0),
        Err(MrfError::TimestampInvalid)
    ));

    // 100 ms cadence while down: each poll re-schedules itself.
    for _ in 0..3 {
        assert_eq!(evr.engine().fire_delayed(), 1);
        evr.engine().pump_all();
        assert!(!evr.time().valid());
    }

    // Link recovers: the poll re-enables the cause and stops rescheduling.
    sim.set_link_down(false);
    assert_eq!(evr.engine().fire_delayed(), 1);
    evr.engine().pump_all();
    assert_ne!(sim.peek32(evr::IRQ_ENABLE) & evr::irq::RXERR, 0);
    assert_eq!(evr.engine().fire_delayed(), 0);

    // Still invalid until a fresh, distinct seconds value arrives.
    assert!(!evr.time().valid());
    seconds_tick(&sim, &evr, 0x6000_0012);
    assert!(evr.time().valid());
    assert_eq!(evr.time().last_valid_seconds(), 0x6000_0012);
}

#[test]
fn clock_program_is_glitch_free_when_idempotent() {
    let (sim, evr) = bring_up();
    let (word, err) = fracsynth::control_word(125.0, FRAC_SYNTH_REF_MHZ, 0);
    assert!(err <= 100.0);
    sim.poke32(evr::FRAC_DIV, word);
    sim.poke32(evr::USEC_DIV, 125);

    evr.clock_set(125.0).unwrap();
    evr.clock_set(125.0).unwrap();

    assert_eq!(sim.write_count(evr::FRAC_DIV), 0);
    assert_eq!(sim.write_count(evr::USEC_DIV), 0);
    assert!((evr.clock() - 125.0).abs() / 125.0 * 1e6 <= 100.0);
}

#[test]
fn clock_program_writes_when_different() {
    let (sim, evr) = bring_up();
    evr.clock_set(125.0).unwrap();
    assert_eq!(sim.write_count(evr::FRAC_DIV), 1);
    assert_eq!(sim.write_count(evr::USEC_DIV), 1);
    assert_eq!(evr.usec_div(), 125);
    assert!(evr.clock_set(1.0).is_err());
}

#[test]
fn subscription_invariant_fifo_save_tracks_interest() {
    let (_sim, evr) = bring_up();
    let cb: EventCallback = Arc::new(|_| {});
    for code in [1u8, 42, 200, 255] {
        evr.subscribe_event(code, Arc::clone(&cb)).unwrap();
        assert!(evr
            .events()
            .is_action_mapped(code, action::FIFO_SAVE)
            .unwrap());
        evr.unsubscribe_event(code, &cb).unwrap();
        assert!(!evr
            .events()
            .is_action_mapped(code, action::FIFO_SAVE)
            .unwrap());
    }
}
