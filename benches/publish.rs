use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use depot::{MsgId, Store, StoreConfig};
use tempfile::TempDir;

fn bench_publish(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.durable_queues.insert("bench".to_string());
    let store = Store::open(config).expect("open");

    let payload = vec![0u8; 1024];
    let mut group = c.benchmark_group("publish");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    let mut n = 0u128;
    group.bench_function("publish_1k", |b| {
        b.iter(|| {
            n += 1;
            store
                .publish("bench", MsgId::from(n), payload.clone(), true, false)
                .expect("publish");
        })
    });
    group.finish();

    store.stop_and_obliterate().expect("obliterate");
}

fn bench_deliver(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let mut config = StoreConfig::new(dir.path().join("store"));
    config.durable_queues.insert("bench".to_string());
    let store = Store::open(config).expect("open");

    let payload = vec![0u8; 1024];
    for n in 0..50_000u128 {
        store
            .publish("bench", MsgId::from(n + 1), payload.clone(), true, false)
            .expect("publish");
    }

    let mut group = c.benchmark_group("deliver");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    let mut delivered = Vec::new();
    group.bench_function("deliver_1k", |b| {
        b.iter(|| match store.deliver("bench").expect("deliver") {
            Some(delivery) => delivered.push((delivery.msg_id, delivery.seq, true)),
            // Backlog exhausted: put everything back at the tail.
            None => store
                .requeue("bench", std::mem::take(&mut delivered))
                .expect("requeue"),
        })
    });
    group.finish();

    store.stop_and_obliterate().expect("obliterate");
}

criterion_group!(benches, bench_publish, bench_deliver);
criterion_main!(benches);
