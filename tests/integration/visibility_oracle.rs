//! Property test: snapshots are immutable. A transaction begun at time T
//! sees exactly the committed state at T, for as long as it stays open,
//! no matter what commits or aborts after it. The oracle is a plain map
//! updated only on commit.

use std::collections::BTreeMap;

use heartwood::{Config, Engine, HeartwoodError, Transaction};
use proptest::prelude::*;
use tempfile::TempDir;

const KEYS: usize = 8;

fn key(idx: usize) -> Vec<u8> {
    format!("k{idx}").into_bytes()
}

#[derive(Clone, Debug)]
enum WriteOp {
    Put(usize, u8),
    Del(usize),
}

#[derive(Clone, Debug)]
enum Step {
    /// One writer transaction running start to finish; `true` commits.
    Writer(Vec<WriteOp>, bool),
    /// Capture a long-lived reader snapshot.
    OpenReader,
    /// Verify every open reader still sees its capture-time state.
    CheckReaders,
}

fn write_op() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        (0..KEYS, any::<u8>()).prop_map(|(k, v)| WriteOp::Put(k, v)),
        (0..KEYS).prop_map(WriteOp::Del),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (prop::collection::vec(write_op(), 1..6), any::<bool>())
            .prop_map(|(ops, commit)| Step::Writer(ops, commit)),
        1 => Just(Step::OpenReader),
        2 => Just(Step::CheckReaders),
    ]
}

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn run_writer(engine: &Engine, model: &mut Model, ops: &[WriteOp], commit: bool) {
    let mut txn = engine.begin().unwrap();
    let mut pending = model.clone();
    for op in ops {
        match op {
            WriteOp::Put(idx, byte) => {
                let k = key(*idx);
                let val = vec![*byte; 3];
                match engine.read(&txn, &k) {
                    Ok((version, _)) => {
                        engine.update(&mut txn, version, &val).unwrap();
                    }
                    Err(HeartwoodError::NotFound) => {
                        engine.insert(&mut txn, &k, &val).unwrap();
                    }
                    Err(err) => panic!("read failed: {err}"),
                }
                pending.insert(k, val);
            }
            WriteOp::Del(idx) => {
                let k = key(*idx);
                match engine.read(&txn, &k) {
                    Ok((version, _)) => {
                        engine.delete(&mut txn, version).unwrap();
                        pending.remove(&k);
                    }
                    Err(HeartwoodError::NotFound) => {}
                    Err(err) => panic!("read failed: {err}"),
                }
            }
        }
    }
    if commit {
        engine.commit(&mut txn).unwrap();
        *model = pending;
    } else {
        engine.abort(&mut txn).unwrap();
    }
}

fn check_view(engine: &Engine, txn: &Transaction, expected: &Model) {
    for idx in 0..KEYS {
        let k = key(idx);
        match (engine.read(txn, &k), expected.get(&k)) {
            (Ok((_, payload)), Some(want)) => assert_eq!(&payload, want, "key {idx}"),
            (Err(HeartwoodError::NotFound), None) => {}
            (got, want) => panic!("key {idx}: engine {got:?}, oracle {want:?}"),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn snapshots_match_commit_time_state(steps in prop::collection::vec(step(), 1..24)) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(Config::compact(dir.path())).unwrap();
        let mut model: Model = BTreeMap::new();
        let mut readers: Vec<(Transaction, Model)> = Vec::new();

        for s in &steps {
            match s {
                Step::Writer(ops, commit) => run_writer(&engine, &mut model, ops, *commit),
                Step::OpenReader => {
                    let txn = engine.begin().unwrap();
                    readers.push((txn, model.clone()));
                }
                Step::CheckReaders => {
                    for (txn, seen) in &readers {
                        check_view(&engine, txn, seen);
                    }
                }
            }
        }
        for (txn, seen) in &readers {
            check_view(&engine, txn, seen);
        }
        let fresh = engine.begin().unwrap();
        check_view(&engine, &fresh, &model);
    }
}
