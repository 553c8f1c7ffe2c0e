//! Benchmarks for the cache hot paths.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kv_cache_tree::kv::frame::Frame;
use kv_cache_tree::{CacheConfig, CacheStore, KvBucket, MemoryBucket};

fn bench_frame_codec(c: &mut Criterion) {
    // 4 KB payload, typical cached document size.
    let payload = vec![42u8; 4096];
    let encoded = Frame::set(1_000_000_000, payload.clone()).encode();

    c.bench_function("frame_encode_4kb", |b| {
        b.iter(|| {
            let bytes = Frame::set(1_000_000_000, payload.clone()).encode();
            black_box(bytes);
        })
    });

    c.bench_function("frame_decode_4kb", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&encoded)).unwrap();
            black_box(frame);
        })
    });
}

fn bench_tree_ops(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(async {
        let kv: Arc<dyn KvBucket> = Arc::new(MemoryBucket::new());
        CacheStore::new(CacheConfig::new("bench"), kv).await.unwrap()
    });

    // Pre-populate 1,000 keys across one level.
    for i in 0..1_000u64 {
        store.set_value(&format!("a.b.{i}"), vec![0u8; 64], false, i as i64 + 1, None);
    }

    c.bench_function("set_value_existing_key", |b| {
        let mut t = 10_000i64;
        b.iter(|| {
            t += 1;
            store.set_value("a.b.500", vec![0u8; 64], false, t, None);
        })
    });

    c.bench_function("get_value_update_time", |b| {
        b.iter(|| {
            black_box(store.get_value_update_time("a.b.500"));
        })
    });

    c.bench_function("get_keys_by_pattern_1k_level", |b| {
        b.iter(|| {
            let keys = rt.block_on(store.get_keys_by_pattern("a.b.*"));
            black_box(keys);
        })
    });

    rt.block_on(async move {
        store.shutdown();
    });
}

criterion_group!(benches, bench_frame_codec, bench_tree_ops);
criterion_main!(benches);
