//! First-committer-wins: two transactions that snapshot the same version
//! and both try to supersede it. The second writer fails immediately with
//! a write conflict, whether or not the first has committed yet. An
//! aborted competitor releases its claim.

use heartwood::{Config, Engine, HeartwoodError};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    Engine::open(Config::compact(dir.path())).unwrap()
}

#[test]
fn second_updater_conflicts_after_first_commits() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut setup = engine.begin().unwrap();
    engine.insert(&mut setup, b"acct", b"100").unwrap();
    engine.commit(&mut setup).unwrap();

    let mut t2 = engine.begin().unwrap();
    let mut t3 = engine.begin().unwrap();
    let (v2, _) = engine.read(&t2, b"acct").unwrap();
    let (v3, _) = engine.read(&t3, b"acct").unwrap();
    assert_eq!(v2, v3);

    engine.update(&mut t2, v2, b"90").unwrap();
    engine.commit(&mut t2).unwrap();

    assert!(matches!(
        engine.update(&mut t3, v3, b"80"),
        Err(HeartwoodError::WriteConflict)
    ));
    engine.abort(&mut t3).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(&reader, b"acct").unwrap().1, b"90");
}

#[test]
fn conflict_raised_before_the_competitor_commits() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut setup = engine.begin().unwrap();
    engine.insert(&mut setup, b"row", b"v").unwrap();
    engine.commit(&mut setup).unwrap();

    let mut t2 = engine.begin().unwrap();
    let mut t3 = engine.begin().unwrap();
    let (v, _) = engine.read(&t2, b"row").unwrap();

    // t2 has only stamped the version, not committed. There is no lock
    // queue: t3 fails now rather than waiting on t2's outcome.
    engine.update(&mut t2, v, b"t2").unwrap();
    assert!(matches!(
        engine.update(&mut t3, v, b"t3"),
        Err(HeartwoodError::WriteConflict)
    ));
    assert!(matches!(
        engine.delete(&mut t3, v),
        Err(HeartwoodError::WriteConflict)
    ));
    engine.abort(&mut t3).unwrap();
    engine.commit(&mut t2).unwrap();
}

#[test]
fn aborted_writer_releases_the_version() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut setup = engine.begin().unwrap();
    engine.insert(&mut setup, b"row", b"v").unwrap();
    engine.commit(&mut setup).unwrap();

    let mut t2 = engine.begin().unwrap();
    let (v, _) = engine.read(&t2, b"row").unwrap();
    engine.update(&mut t2, v, b"t2").unwrap();
    engine.abort(&mut t2).unwrap();

    // The aborted stamp is overwritable; a later writer wins.
    let mut t3 = engine.begin().unwrap();
    let (v3, _) = engine.read(&t3, b"row").unwrap();
    assert_eq!(v, v3);
    engine.update(&mut t3, v3, b"t3").unwrap();
    engine.commit(&mut t3).unwrap();

    let reader = engine.begin().unwrap();
    assert_eq!(engine.read(&reader, b"row").unwrap().1, b"t3");
}

#[test]
fn exactly_one_of_many_racing_writers_wins() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut setup = engine.begin().unwrap();
    engine.insert(&mut setup, b"slot", b"free").unwrap();
    engine.commit(&mut setup).unwrap();

    let mut txns: Vec<_> = (0..5).map(|_| engine.begin().unwrap()).collect();
    let versions: Vec<_> = txns
        .iter()
        .map(|t| engine.read(t, b"slot").unwrap().0)
        .collect();

    let mut wins = 0;
    for (i, txn) in txns.iter_mut().enumerate() {
        match engine.update(txn, versions[i], format!("w{i}").as_bytes()) {
            Ok(_) => {
                engine.commit(txn).unwrap();
                wins += 1;
            }
            Err(HeartwoodError::WriteConflict) => engine.abort(txn).unwrap(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(wins, 1);
}
