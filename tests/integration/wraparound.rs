//! Transaction-id wraparound: with tiny thresholds, burning ids without
//! freezing eventually refuses new transactions, and an aggressive
//! reclaim pass that freezes everything lifts the stop.

use heartwood::{
    Config, Engine, HeartwoodError, VacuumMode, WraparoundPolicy,
};
use tempfile::TempDir;

fn tiny_policy() -> WraparoundPolicy {
    WraparoundPolicy {
        freeze_age: 4,
        danger_age: 8,
        stop_age: 16,
    }
}

fn open(dir: &TempDir) -> Engine {
    Engine::open(Config::compact(dir.path()).wraparound(tiny_policy())).unwrap()
}

fn burn_one(engine: &Engine, i: u32) -> Result<(), HeartwoodError> {
    let mut txn = engine.begin()?;
    engine.insert(&mut txn, format!("burn:{i}").as_bytes(), b"x")?;
    engine.commit(&mut txn)?;
    Ok(())
}

#[test]
fn begin_refuses_past_the_stop_age() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut refused = None;
    for i in 0..64 {
        match burn_one(&engine, i) {
            Ok(()) => {}
            Err(HeartwoodError::WraparoundFatal { age }) => {
                refused = Some(age);
                break;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    let age = refused.unwrap_or_else(|| panic!("stop threshold never reached"));
    assert!(age >= tiny_policy().stop_age);
}

#[test]
fn danger_flag_rises_with_age() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    assert!(!engine.status().wraparound_danger);
    for i in 0..10 {
        burn_one(&engine, i).unwrap();
    }
    assert!(engine.status().wraparound_danger);
}

#[test]
fn aggressive_freeze_lifts_the_stop() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    for i in 0..64 {
        match burn_one(&engine, i) {
            Ok(()) => {}
            Err(HeartwoodError::WraparoundFatal { .. }) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert!(matches!(
        engine.begin(),
        Err(HeartwoodError::WraparoundFatal { .. })
    ));

    let stats = engine.vacuum(VacuumMode::Aggressive).unwrap();
    assert!(stats.frozen > 0, "pass should have frozen old versions");
    assert!(stats.oldest_unfrozen_age < tiny_policy().stop_age);

    // New transactions flow again, and frozen rows stay readable.
    let mut txn = engine.begin().unwrap();
    engine.insert(&mut txn, b"fresh", b"ok").unwrap();
    engine.commit(&mut txn).unwrap();
    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(&reader, b"burn:0").unwrap().1, b"x");
}

#[test]
fn frozen_rows_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for i in 0..8 {
            burn_one(&engine, i).unwrap();
        }
        engine.vacuum(VacuumMode::Aggressive).unwrap();
        engine.close().unwrap();
    }
    let engine = open(&dir);
    let reader = engine.begin().unwrap();
    for i in 0..8 {
        assert_eq!(
            engine.read(&reader, format!("burn:{i}").as_bytes()).unwrap().1,
            b"x"
        );
    }
    assert!(!engine.status().wraparound_danger);
}
