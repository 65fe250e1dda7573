use depot::{MsgId, Store, StoreConfig};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.segment_cap = 16 * 1024;
    config.durable_queues.insert("q".to_string());
    config
}

#[test]
fn requeued_messages_come_back_after_the_unacked_head() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(test_config(&dir)).expect("open");

    for n in 1..=3u128 {
        store
            .publish("q", MsgId::from(n), format!("m{n}").into_bytes(), true, false)
            .expect("publish");
    }
    let m1 = store.deliver("q").expect("deliver").expect("m1");
    let m2 = store.deliver("q").expect("deliver").expect("m2");
    let m3 = store.deliver("q").expect("deliver").expect("m3");
    assert_eq!(m3.remaining, 0);

    store
        .requeue("q", vec![(m1.msg_id, m1.seq, true), (m2.msg_id, m2.seq, true)])
        .expect("requeue");

    let order: Vec<Vec<u8>> = (0..3)
        .map(|_| store.deliver("q").expect("deliver").expect("message").payload)
        .collect();
    assert_eq!(order, vec![b"m3".to_vec(), b"m1".to_vec(), b"m2".to_vec()]);
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn requeue_next_n_rotates_the_head_to_the_tail() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(test_config(&dir)).expect("open");

    for n in 1..=4u128 {
        store
            .publish("q", MsgId::from(n), format!("m{n}").into_bytes(), true, false)
            .expect("publish");
    }
    store.requeue_next_n("q", 2).expect("requeue_next_n");
    assert_eq!(store.length("q").expect("length"), 4);

    let order: Vec<Vec<u8>> = (0..4)
        .map(|_| store.deliver("q").expect("deliver").expect("message").payload)
        .collect();
    assert_eq!(
        order,
        vec![b"m3".to_vec(), b"m4".to_vec(), b"m1".to_vec(), b"m2".to_vec()]
    );
    store.stop().expect("stop");
}

#[test]
fn purge_empties_the_queue() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    let count = 1000u64;
    for n in 0..count {
        store
            .publish("q", MsgId::from(n as u128 + 1), b"payload".to_vec(), true, false)
            .expect("publish");
    }
    assert_eq!(store.purge("q").expect("purge"), count);
    assert_eq!(store.length("q").expect("length"), 0);
    assert!(store.deliver("q").expect("deliver").is_none());

    // The queue keeps working, sequences continuing past the purge.
    store
        .publish("q", MsgId::from(9999u128), b"after".to_vec(), true, false)
        .expect("publish");
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.payload, b"after".to_vec());
    assert_eq!(delivery.seq, count);
    store.stop().expect("stop");
    drop(store);

    let store = Store::open(config).expect("reopen");
    // Only the post-purge message survives (delivered, never acked).
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.payload, b"after".to_vec());
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn delete_queue_removes_everything() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    for n in 1..=3u128 {
        store
            .publish("q", MsgId::from(n), b"payload".to_vec(), true, false)
            .expect("publish");
    }
    store.delete_queue("q").expect("delete_queue");
    assert_eq!(store.length("q").expect("length"), 0);
    assert!(store.deliver("q").expect("deliver").is_none());

    // A deleted queue starts over from seq zero.
    store
        .publish("q", MsgId::from(9u128), b"fresh".to_vec(), true, false)
        .expect("publish");
    let delivery = store.deliver("q").expect("deliver").expect("message");
    assert_eq!(delivery.seq, 0);
    store.stop().expect("stop");
}

#[test]
fn stop_and_obliterate_deletes_the_store() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");
    store
        .publish("q", MsgId::from(1u128), b"doomed".to_vec(), true, false)
        .expect("publish");
    store.stop_and_obliterate().expect("obliterate");
    drop(store);

    assert!(!config.dir.exists());

    // A fresh store opens cleanly over the obliterated path.
    let store = Store::open(config).expect("open fresh");
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}
