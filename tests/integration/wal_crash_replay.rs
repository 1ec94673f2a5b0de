//! Crash recovery: drop the process's handle on the engine without a
//! clean shutdown (std::mem::forget, so no close/checkpoint runs) and
//! reopen the directory. Committed work must survive, uncommitted work
//! must not, and replaying over already-applied pages must be harmless.

use std::mem;

use heartwood::{Config, Engine, HeartwoodError};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    Engine::open(Config::compact(dir.path())).unwrap()
}

/// Abandon the engine without running shutdown, as a crash would.
fn crash(engine: Engine) {
    mem::forget(engine);
}

#[test]
fn committed_work_survives_a_crash() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin().unwrap();
        for i in 0..20u32 {
            engine
                .insert(&mut txn, format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        engine.commit(&mut txn).unwrap();

        // In-flight at crash time: must be rolled back by recovery.
        let mut orphan = engine.begin().unwrap();
        engine.insert(&mut orphan, b"orphan", b"lost").unwrap();
        crash(engine);
    }

    let engine = open(&dir);
    let reader = engine.begin().unwrap();
    for i in 0..20u32 {
        let (_, payload) = engine.read(&reader, format!("k{i}").as_bytes()).unwrap();
        assert_eq!(payload, format!("v{i}").as_bytes());
    }
    assert!(matches!(
        engine.read(&reader, b"orphan"),
        Err(HeartwoodError::NotFound)
    ));
}

#[test]
fn recovery_replays_from_the_checkpoint() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin().unwrap();
        let before = engine.insert(&mut txn, b"stable", b"one").unwrap();
        engine.commit(&mut txn).unwrap();

        engine.checkpoint().unwrap();

        // Work after the checkpoint exists only in the log.
        let mut txn = engine.begin().unwrap();
        engine.update(&mut txn, before, b"two").unwrap();
        engine.insert(&mut txn, b"late", b"yes").unwrap();
        engine.commit(&mut txn).unwrap();
        crash(engine);
    }

    let engine = open(&dir);
    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(&reader, b"stable").unwrap().1, b"two");
    assert_eq!(engine.read(&reader, b"late").unwrap().1, b"yes");
}

#[test]
fn repeated_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin().unwrap();
        let v = engine.insert(&mut txn, b"a", b"1").unwrap();
        engine.insert(&mut txn, b"b", b"2").unwrap();
        engine.commit(&mut txn).unwrap();
        let mut txn = engine.begin().unwrap();
        engine.update(&mut txn, v, b"1.1").unwrap();
        engine.commit(&mut txn).unwrap();
        crash(engine);
    }
    // Two crash/recover cycles replay the same records over the same
    // pages; the second must read identically to the first.
    for _ in 0..2 {
        let engine = open(&dir);
        let reader = engine.begin().unwrap();
        assert_eq!(engine.read(&reader, b"a").unwrap().1, b"1.1");
        assert_eq!(engine.read(&reader, b"b").unwrap().1, b"2");
        crash(engine);
    }
}

#[test]
fn reinsert_after_delete_survives_a_crash() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let mut txn = engine.begin().unwrap();
        let v = engine.insert(&mut txn, b"cycle", b"first").unwrap();
        engine.commit(&mut txn).unwrap();

        let mut txn = engine.begin().unwrap();
        engine.delete(&mut txn, v).unwrap();
        engine.commit(&mut txn).unwrap();

        // The reinsert chains onto the key's surviving versions; replay
        // must reproduce that linkage.
        let mut txn = engine.begin().unwrap();
        engine.insert(&mut txn, b"cycle", b"second").unwrap();
        engine.commit(&mut txn).unwrap();
        crash(engine);
    }

    let engine = open(&dir);
    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(&reader, b"cycle").unwrap().1, b"second");
}

#[test]
fn wal_spans_segments() {
    let dir = TempDir::new().unwrap();
    {
        // Compact profile uses 16 KiB segments; this writes well past one.
        let engine = open(&dir);
        let payload = vec![0xabu8; 400];
        for i in 0..120u32 {
            let mut txn = engine.begin().unwrap();
            engine
                .insert(&mut txn, format!("seg:{i:04}").as_bytes(), &payload)
                .unwrap();
            engine.commit(&mut txn).unwrap();
        }
        crash(engine);
    }

    let engine = open(&dir);
    let reader = engine.begin().unwrap();
    for i in 0..120u32 {
        let (_, payload) = engine
            .read(&reader, format!("seg:{i:04}").as_bytes())
            .unwrap();
        assert_eq!(payload.len(), 400);
    }
}
