//! End-to-end generator scenarios: the full sequence lifecycle against
//! the simulated card, including the hardware stop interrupt and the
//! two-leg sync that follows it.

use std::sync::Arc;

use mrf_chip::evg;
use mrf_chip::EVENT_SEQ_END;
use mrf_driver::prelude::*;
use mrf_driver::sim::SimCard;

fn bring_up() -> (Arc<SimCard>, Arc<Evg>) {
    let sim = Arc::new(SimCard::evg());
    let evg = Evg::new(1, Arc::clone(&sim) as Arc<dyn RegIo>, &EvgConfig { threaded: false })
        .unwrap();
    evg.enable(true);
    evg.irq_enable(true);
    (sim, evg)
}

#[test]
fn bad_signature_is_rejected() {
    let sim = Arc::new(SimCard::evr()); // an EVR window is not an EVG
    assert!(matches!(
        Evg::new(1, sim as Arc<dyn RegIo>, &EvgConfig { threaded: false }),
        Err(MrfError::BadDevice { .. })
    ));
}

#[test]
fn sequence_lifecycle() {
    let (sim, evg) = bring_up();
    let mgr = evg.seq_mgr();

    let seq = mgr.create();
    assert_eq!(seq.state(), SeqState::Empty);

    seq.set_event_codes(&[1, 2, 3]).unwrap();
    assert_eq!(seq.state(), SeqState::Dirty);
    seq.set_timestamps_ticks(&[125_000_000, 250_000_000, 500_000_000])
        .unwrap();
    seq.set_trig_src(0).unwrap();
    seq.set_run_mode(SeqRunMode::Single);

    seq.commit().unwrap();
    assert_eq!(seq.state(), SeqState::Committed);

    let slot = mgr.load(seq.id()).unwrap();
    assert_eq!(slot, 0);
    assert_eq!(seq.state(), SeqState::Loaded(0));

    mgr.enable(seq.id()).unwrap();
    assert_eq!(seq.state(), SeqState::Running(0));

    // Hardware reaches the terminator and reports the stop.
    sim.complete_sequence(0);
    assert!(evg.isr());
    assert_eq!(evg.count_seq_stop(), 1);
    evg.pump_syncs();
    evg.engine().pump_all();

    assert_eq!(seq.state(), SeqState::Loaded(0));
    assert!(!seq.needs_sync());

    assert_eq!(sim.seq_ram_row(0, 0), (1, 125_000_000));
    assert_eq!(sim.seq_ram_row(0, 1), (2, 250_000_000));
    assert_eq!(sim.seq_ram_row(0, 2), (3, 500_000_000));
    assert_eq!(sim.seq_ram_row(0, 3), (EVENT_SEQ_END, 500_000_001));
    assert_eq!(mgr.slot_owner(1), None);
    assert_eq!(mgr.bound_count(), 1);
}

#[test]
fn commit_load_unload_commit_leaves_bindings_unchanged() {
    let (_sim, evg) = bring_up();
    let mgr = evg.seq_mgr();
    let seq = mgr.create();
    seq.set_event_codes(&[9]).unwrap();
    seq.set_timestamps_ticks(&[42]).unwrap();

    let before = mgr.bound_count();
    seq.commit().unwrap();
    mgr.load(seq.id()).unwrap();
    mgr.unload(seq.id()).unwrap();
    seq.commit().unwrap();
    assert_eq!(mgr.bound_count(), before);
}

#[test]
fn run_mode_programs_control_bits() {
    let (sim, evg) = bring_up();
    let mgr = evg.seq_mgr();

    for (mode, want) in [
        (SeqRunMode::Single, evg::seq_ctrl::SINGLE),
        (SeqRunMode::Auto, evg::seq_ctrl::RECYCLE),
        (SeqRunMode::External, 0),
    ] {
        let seq = mgr.create();
        seq.set_event_codes(&[1]).unwrap();
        seq.set_timestamps_ticks(&[1]).unwrap();
        seq.set_trig_src(17).unwrap();
        seq.set_run_mode(mode);
        seq.commit().unwrap();
        let slot = mgr.load(seq.id()).unwrap();

        let ctrl = sim.peek32(evg::seq_ctrl(slot));
        assert_eq!(ctrl & (evg::seq_ctrl::SINGLE | evg::seq_ctrl::RECYCLE), want);
        assert_eq!(ctrl & evg::seq_ctrl::TRIG_MASK, 17);
        mgr.unload(seq.id()).unwrap();
    }
}

#[test]
fn software_event_and_clock() {
    let (sim, evg) = bring_up();

    evg.soft_evt().set_enabled(true);
    evg.soft_evt().inject(42).unwrap();
    assert_eq!(evg.soft_evt().code(), 42);

    evg.set_clock_speed(125.0).unwrap();
    assert_eq!(sim.write_count(evg::FRAC_SYNTH_WORD), 1);
    // Same speed again: the synthesizer word is untouched.
    evg.set_clock_speed(125.0).unwrap();
    assert_eq!(sim.write_count(evg::FRAC_SYNTH_WORD), 1);
    assert!((evg.clock_speed() - 125.0).abs() < 1e-12);

    evg.set_clock_source(EvgClockSource::ExternalRf(4)).unwrap();
    assert_eq!(evg.clock_source(), EvgClockSource::ExternalRf(4));
    assert!(evg
        .set_clock_source(EvgClockSource::ExternalRf(33))
        .is_err());
}

#[test]
fn registry_holds_both_card_types() {
    let (_s1, evg) = bring_up();
    let sim = Arc::new(SimCard::evr());
    let evr = Evr::new(
        0,
        sim as Arc<dyn RegIo>,
        &EvrConfig {
            threaded: false,
            ..EvrConfig::default()
        },
    )
    .unwrap();

    let registry = CardRegistry::new();
    registry.register(0, Card::Evr(evr)).unwrap();
    registry.register(1, Card::Evg(Arc::clone(&evg))).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.get(1).unwrap().as_evg().is_some());
    assert!(registry.get(0).unwrap().as_evg().is_none());
    registry.clear();
    assert!(registry.is_empty());
}
