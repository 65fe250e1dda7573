//! Recovery from on-disk states left behind by interrupted compaction,
//! built by splicing segment files directly.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use depot::record::{scan_records, ScannedRecord, FRAMING};
use depot::{segment, MsgId, Store, StoreConfig};
use tempfile::TempDir;

const CAP: u64 = 1024;

fn test_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.segment_cap = CAP;
    config.durable_queues.insert("q".to_string());
    config
}

fn payload_for(i: usize) -> Vec<u8> {
    format!("{i:0100}").into_bytes()
}

/// Publish ten messages (spanning two segments at this cap) and stop.
fn seeded_store(dir: &TempDir) -> StoreConfig {
    let config = test_config(dir);
    let store = Store::open(config.clone()).expect("open");
    for i in 0..10 {
        store
            .publish("q", MsgId::from(i as u128 + 1), payload_for(i), true, false)
            .expect("publish");
    }
    store.stop().expect("stop");
    drop(store);
    config
}

fn scan_segment(config: &StoreConfig, id: u64) -> (Vec<u8>, Vec<ScannedRecord>) {
    let bytes = std::fs::read(segment::segment_path(&config.dir, id)).expect("read segment");
    let mut file = std::fs::File::open(segment::segment_path(&config.dir, id)).expect("open");
    let records = scan_records(&mut file).expect("scan");
    (bytes, records)
}

fn frame_range(rec: &ScannedRecord) -> std::ops::Range<usize> {
    rec.offset as usize..(rec.offset + rec.total_size + FRAMING) as usize
}

fn deliver_all_in_order(config: &StoreConfig) {
    let store = Store::open(config.clone()).expect("reopen");
    for i in 0..10 {
        let delivery = store.deliver("q").expect("deliver").expect("message");
        assert_eq!(delivery.payload, payload_for(i), "message {i} out of order");
    }
    assert!(store.deliver("q").expect("deliver").is_none());
    store.stop().expect("stop");
}

#[test]
fn stale_temp_file_is_deleted() {
    let dir = TempDir::new().expect("tempdir");
    let config = seeded_store(&dir);

    // A temp whose records all still exist in the main file: the
    // combine got as far as writing the temp and no further.
    let (bytes, records) = scan_segment(&config, 0);
    assert!(records.len() >= 3);
    let mut temp = Vec::new();
    temp.extend_from_slice(&bytes[frame_range(&records[1])]);
    temp.extend_from_slice(&bytes[frame_range(&records[2])]);
    std::fs::write(segment::temp_path(&config.dir, 0), &temp).expect("write temp");

    deliver_all_in_order(&config);
    assert!(!segment::temp_path(&config.dir, 0).exists());
}

#[test]
fn empty_of_live_records_temp_file_is_deleted() {
    let dir = TempDir::new().expect("tempdir");
    let config = seeded_store(&dir);

    // A temp holding only garbage classifies as case one.
    std::fs::write(segment::temp_path(&config.dir, 0), vec![0u8; 64]).expect("write temp");

    deliver_all_in_order(&config);
    assert!(!segment::temp_path(&config.dir, 0).exists());
}

#[test]
fn interrupted_rewrite_is_replayed_from_the_temp_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = seeded_store(&dir);

    // Simulate a crash between truncating the destination and copying
    // the temp back: the temp holds every record above the contiguous
    // prefix, the main file only the prefix itself.
    let (bytes, records) = scan_segment(&config, 0);
    assert!(records.len() >= 2);
    let mut temp = Vec::new();
    for rec in &records[1..] {
        temp.extend_from_slice(&bytes[frame_range(rec)]);
    }
    std::fs::write(segment::temp_path(&config.dir, 0), &temp).expect("write temp");

    let main = OpenOptions::new()
        .write(true)
        .open(segment::segment_path(&config.dir, 0))
        .expect("open main");
    main.set_len(records[1].offset).expect("truncate main");
    drop(main);

    deliver_all_in_order(&config);
    assert!(!segment::temp_path(&config.dir, 0).exists());
}

#[test]
fn duplicate_copy_from_unfinished_combine_is_discarded() {
    let dir = TempDir::new().expect("tempdir");
    let config = seeded_store(&dir);

    // Simulate a crash after a combine copied the source's first
    // record into the destination but before the source was deleted:
    // the same id now exists in both segments.
    let (source_bytes, source_records) = scan_segment(&config, 1);
    assert!(!source_records.is_empty());
    let (_, dest_records) = scan_segment(&config, 0);
    let dest_end = dest_records
        .last()
        .map(|rec| rec.offset + rec.total_size + FRAMING)
        .expect("destination has records");

    let mut dest = OpenOptions::new()
        .write(true)
        .open(segment::segment_path(&config.dir, 0))
        .expect("open dest");
    dest.seek(SeekFrom::Start(dest_end)).expect("seek");
    dest.write_all(&source_bytes[frame_range(&source_records[0])])
        .expect("write duplicate");
    dest.sync_data().expect("sync");
    drop(dest);

    // Each message is still delivered exactly once, in order.
    deliver_all_in_order(&config);
}
