use std::time::Duration;

use depot::{MsgId, Store, StoreConfig};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.segment_cap = 8192;
    config.durable_queues.insert("q".to_string());
    config
}

#[test]
fn tx_commit_reply_waits_for_a_sync() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(&dir);
    // Make the commit timer effectively never fire; the only syncs are
    // forced ones.
    config.sync_interval = Duration::from_secs(3600);
    let store = Store::open(config).expect("open");

    let a = MsgId::from(1u128);
    let b = MsgId::from(2u128);
    store.tx_publish(a, b"first".to_vec(), true).expect("tx_publish");
    store.tx_publish(b, b"second".to_vec(), true).expect("tx_publish");

    let committer = store.clone();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let handle = std::thread::spawn(move || {
        let result = committer.tx_commit("q", vec![a, b], vec![]);
        let _ = done_tx.send(result);
    });

    // The records sit past the last fsync, so the reply is deferred.
    assert!(
        done_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "tx_commit replied before any fsync"
    );

    // Reading the unsynced tail forces a sync, which releases the
    // deferred commit.
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.msg_id, a);
    assert_eq!(delivery.payload, b"first".to_vec());

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("commit released by sync")
        .expect("commit ok");
    handle.join().expect("join");
    store.stop().expect("stop");
}

#[test]
fn committed_transaction_survives_restart_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    let a = MsgId::from(1u128);
    let b = MsgId::from(2u128);
    store.tx_publish(a, b"first".to_vec(), true).expect("tx_publish");
    store.tx_publish(b, b"second".to_vec(), true).expect("tx_publish");
    // Not queue-visible before the commit.
    assert_eq!(store.length("q").expect("length"), 0);

    store.tx_commit("q", vec![a, b], vec![]).expect("tx_commit");
    assert_eq!(store.length("q").expect("length"), 2);
    store.stop().expect("stop");
    drop(store);

    let store = Store::open(config).expect("reopen");
    let first = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(first.payload, b"first".to_vec());
    let second = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(second.payload, b"second".to_vec());
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn tx_commit_applies_acks_atomically_with_publishes() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    store
        .publish("q", MsgId::from(1u128), b"old".to_vec(), true, false)
        .expect("publish");
    let old = store.deliver("q").expect("deliver").expect("message");

    let fresh = MsgId::from(2u128);
    store.tx_publish(fresh, b"new".to_vec(), true).expect("tx_publish");
    store
        .tx_commit("q", vec![fresh], vec![(old.msg_id, old.seq)])
        .expect("tx_commit");

    assert_eq!(store.length("q").expect("length"), 1);
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.payload, b"new".to_vec());
    store.stop().expect("stop");
    drop(store);

    // The acked message is gone for good, the committed one remains.
    let store = Store::open(config).expect("reopen");
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.payload, b"new".to_vec());
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn tx_cancel_releases_references() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    let id = MsgId::from(9u128);
    store.tx_publish(id, b"abandoned".to_vec(), true).expect("tx_publish");
    store.tx_cancel(vec![id]).expect("tx_cancel");
    assert_eq!(store.length("q").expect("length"), 0);
    store.stop().expect("stop");
    drop(store);

    let store = Store::open(config).expect("reopen");
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}
