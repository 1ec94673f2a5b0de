//! Replication: streaming to standbys over in-memory channels, quorum
//! commit waits, demotion of a dead replica, epoch fencing, and promotion.

use std::time::{Duration, Instant};

use heartwood::repl::transport::{memory_pair, ReplicaChannel};
use heartwood::repl::wire::Message;
use heartwood::{Config, Engine, Epoch, HeartwoodError, ReplicationConfig, Standby};
use tempfile::TempDir;

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn primary(dir: &TempDir, quorum: usize, commit_timeout: Option<Duration>) -> Engine {
    let replication = ReplicationConfig {
        quorum,
        commit_timeout,
        ..ReplicationConfig::default()
    };
    Engine::open(Config::compact(dir.path()).replication(replication)).unwrap()
}

fn standby(dir: &TempDir) -> Standby {
    Standby::open(Config::compact(dir.path())).unwrap()
}

struct Cluster {
    engine: Engine,
    standby: Standby,
}

fn connect(engine: Engine, standby: Standby) -> Cluster {
    let (primary_end, standby_end) = memory_pair();
    standby.start(Box::new(standby_end)).unwrap();
    engine.add_replica(Box::new(primary_end), true).unwrap();
    Cluster { engine, standby }
}

#[test]
fn commit_waits_for_one_standby_and_data_arrives() {
    let p_dir = TempDir::new().unwrap();
    let s_dir = TempDir::new().unwrap();
    let cluster = connect(
        primary(&p_dir, 1, Some(Duration::from_secs(5))),
        standby(&s_dir),
    );

    let mut txn = cluster.engine.begin().unwrap();
    cluster.engine.insert(&mut txn, b"city", b"lisbon").unwrap();
    let commit_lsn = cluster.engine.commit(&mut txn).unwrap();

    // A returned commit means the quorum flushed it; applying may lag a
    // beat behind the ack loop.
    wait_until("standby apply", || {
        cluster.standby.progress().applied.0 > commit_lsn.0
    });
    assert_eq!(cluster.standby.read(b"city").unwrap().1, b"lisbon");
    let progress = cluster.standby.progress();
    assert_eq!(progress.flushed, progress.received);
}

#[test]
fn any_one_of_two_standbys_satisfies_quorum() {
    let p_dir = TempDir::new().unwrap();
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let engine = primary(&p_dir, 1, Some(Duration::from_secs(5)));

    let standby_a = standby(&a_dir);
    let (a_primary, a_standby) = memory_pair();
    standby_a.start(Box::new(a_standby)).unwrap();
    engine.add_replica(Box::new(a_primary), true).unwrap();

    let standby_b = standby(&b_dir);
    let (b_primary, b_standby) = memory_pair();
    standby_b.start(Box::new(b_standby)).unwrap();
    engine.add_replica(Box::new(b_primary.clone()), true).unwrap();

    // Partition B away; A alone still forms the quorum of one.
    b_primary.disconnect();

    let mut txn = engine.begin().unwrap();
    engine.insert(&mut txn, b"k", b"v").unwrap();
    engine.commit(&mut txn).unwrap();

    wait_until("standby a apply", || {
        standby_a.read(b"k").is_ok()
    });
}

#[test]
fn quorum_of_two_times_out_with_one_standby() {
    let p_dir = TempDir::new().unwrap();
    let s_dir = TempDir::new().unwrap();
    let cluster = connect(
        primary(&p_dir, 2, Some(Duration::from_millis(300))),
        standby(&s_dir),
    );

    let mut txn = cluster.engine.begin().unwrap();
    cluster.engine.insert(&mut txn, b"k", b"v").unwrap();
    assert!(matches!(
        cluster.engine.commit(&mut txn),
        Err(HeartwoodError::ReplicationTimeout)
    ));
    // The commit is locally durable and visible despite the quorum miss.
    let reader = cluster.engine.begin().unwrap();
    assert_eq!(cluster.engine.read(&reader, b"k").unwrap().1, b"v");

    // Restoring the quorum requirement to what is reachable unblocks
    // later commits.
    cluster.engine.reconfigure_quorum(1);
    let mut txn = cluster.engine.begin().unwrap();
    cluster.engine.insert(&mut txn, b"k2", b"v2").unwrap();
    cluster.engine.commit(&mut txn).unwrap();
}

#[test]
fn ack_from_a_newer_epoch_fences_the_primary() {
    let p_dir = TempDir::new().unwrap();
    let engine = primary(&p_dir, 0, None);

    let mut txn = engine.begin().unwrap();
    engine.insert(&mut txn, b"k", b"v").unwrap();
    engine.commit(&mut txn).unwrap();

    let (primary_end, far_end) = memory_pair();
    engine.add_replica(Box::new(primary_end), true).unwrap();
    far_end
        .send(&Message::Start {
            start_lsn: heartwood::Lsn(0),
            epoch: Epoch(0),
        })
        .unwrap();
    // Drain whatever the primary streams, then claim a newer generation.
    wait_until("stream from primary", || {
        matches!(far_end.recv(Duration::from_millis(50)), Ok(Some(_)))
    });
    far_end
        .send(&Message::Ack {
            received: heartwood::Lsn(0),
            flushed: heartwood::Lsn(0),
            applied: heartwood::Lsn(0),
            epoch: Epoch(1),
        })
        .unwrap();

    wait_until("fencing", || engine.begin().is_err());
    assert!(matches!(
        engine.begin(),
        Err(HeartwoodError::StalePrimary { observed: Epoch(1) })
    ));
}

#[test]
fn caught_up_standby_promotes_and_serves_writes() {
    let p_dir = TempDir::new().unwrap();
    let s_dir = TempDir::new().unwrap();
    let cluster = connect(
        primary(&p_dir, 1, Some(Duration::from_secs(5))),
        standby(&s_dir),
    );

    let mut txn = cluster.engine.begin().unwrap();
    cluster.engine.insert(&mut txn, b"seed", b"1").unwrap();
    let commit_lsn = cluster.engine.commit(&mut txn).unwrap();
    cluster.engine.close().unwrap();

    wait_until("standby caught up", || {
        let p = cluster.standby.progress();
        p.applied == p.received && p.applied.0 > commit_lsn.0
    });
    let new_epoch = cluster.standby.promote().unwrap();
    assert_eq!(new_epoch, Epoch(1));

    let promoted = Engine::open(Config::compact(s_dir.path())).unwrap();
    assert_eq!(promoted.epoch(), Epoch(1));
    let reader = promoted.begin().unwrap();
    assert_eq!(promoted.read(&reader, b"seed").unwrap().1, b"1");
    let mut txn = promoted.begin().unwrap();
    promoted.insert(&mut txn, b"after", b"2").unwrap();
    promoted.commit(&mut txn).unwrap();
}

#[test]
fn idle_standby_promotes_cleanly() {
    let s_dir = TempDir::new().unwrap();
    let standby = standby(&s_dir);
    let (_primary_end, standby_end) = memory_pair();
    standby.start(Box::new(standby_end)).unwrap();

    // Nothing received, nothing to apply: trivially caught up.
    let progress = standby.progress();
    assert_eq!(progress.applied, progress.received);
    assert_eq!(standby.promote().unwrap(), Epoch(1));
}
