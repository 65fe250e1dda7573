use std::time::Duration;

use depot::{MsgId, Store, StoreConfig};
use tempfile::TempDir;

const CAP: u64 = 4096;

fn test_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.segment_cap = CAP;
    config.durable_queues.insert("q".to_string());
    config
}

fn segment_files(config: &StoreConfig) -> Vec<(u64, u64)> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(&config.dir).expect("read_dir") {
        let entry = entry.expect("entry");
        let name = entry.file_name();
        let name = name.to_str().expect("utf-8 name");
        if let Some(id) = depot::segment::parse_segment_filename(name) {
            segments.push((id, entry.metadata().expect("metadata").len()));
        }
    }
    segments.sort_unstable();
    segments
}

fn payload_for(i: usize) -> Vec<u8> {
    format!("{i:0100}").into_bytes()
}

#[test]
fn acked_holes_shrink_the_segment_count() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    let count = 120usize;
    for i in 0..count {
        store
            .publish("q", MsgId::from(i as u128 + 1), payload_for(i), true, false)
            .expect("publish");
    }
    assert_eq!(store.length("q").expect("length"), count as u64);
    let before = segment_files(&config).len();
    assert!(before > 2, "expected several segments, got {before}");

    let mut tags = Vec::new();
    for i in 0..count {
        let delivery = store.deliver("q").expect("deliver").expect("message");
        assert_eq!(delivery.payload, payload_for(i));
        tags.push((delivery.msg_id, delivery.seq));
    }

    // Ack the odd-indexed half, punching holes everywhere.
    let odd: Vec<_> = tags
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, tag)| *tag)
        .collect();
    store.ack("q", odd).expect("ack");

    // A sync op flushes the command queue, then the background
    // compaction pass gets its turn.
    assert_eq!(store.length("q").expect("length"), 0);
    std::thread::sleep(Duration::from_millis(500));

    let after = segment_files(&config);
    assert!(
        after.len() < before,
        "compaction should shrink {before} segments, still {}",
        after.len()
    );
    for (id, len) in &after {
        assert!(*len <= CAP, "segment {id} grew past the cap: {len}");
    }

    store.stop().expect("stop");
    drop(store);

    // The surviving even half comes back in publication order.
    let store = Store::open(config).expect("reopen");
    for i in (0..count).filter(|i| i % 2 == 0) {
        let delivery = store.deliver("q").expect("deliver").expect("message");
        assert_eq!(delivery.payload, payload_for(i));
        assert!(delivery.redelivered);
    }
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn fully_acked_store_drops_all_but_current_segment() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = Store::open(config.clone()).expect("open");

    let count = 60usize;
    for i in 0..count {
        store
            .publish("q", MsgId::from(i as u128 + 1), payload_for(i), true, false)
            .expect("publish");
    }
    let mut tags = Vec::new();
    for _ in 0..count {
        let delivery = store.deliver("q").expect("deliver").expect("message");
        tags.push((delivery.msg_id, delivery.seq));
    }
    store.ack("q", tags).expect("ack");

    assert_eq!(store.length("q").expect("length"), 0);
    std::thread::sleep(Duration::from_millis(500));

    // Everything is a hole; only the current append segment remains.
    let remaining = segment_files(&config);
    assert_eq!(remaining.len(), 1, "segments left: {remaining:?}");

    store.stop().expect("stop");
}
