use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use kv::config::EngineConfig;
use kv::engine::Engine;

fn open_engine(dir: &TempDir) -> Engine {
    let mut cfg = EngineConfig::default();
    cfg.data_dir = dir.path().to_string_lossy().to_string();
    cfg.nb_workers = 2;
    Engine::open(cfg).expect("engine opens")
}

fn put_get_delete(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let mut group = c.benchmark_group("engine");
    let mut counter: u64 = 0;

    group.bench_function("put", |b| {
        b.iter(|| {
            counter += 1;
            let key = format!("key-{counter}");
            engine.put(black_box(key.as_bytes()), black_box(b"value".to_vec())).unwrap();
        })
    });

    engine.put(b"bench_get_key", b"value".to_vec()).unwrap();
    group.bench_function("get", |b| {
        b.iter(|| {
            black_box(engine.get(black_box(b"bench_get_key")).unwrap());
        })
    });

    group.bench_function("delete", |b| {
        b.iter(|| {
            counter += 1;
            let key = format!("del-{counter}");
            engine.put(key.as_bytes(), b"value".to_vec()).unwrap();
            engine.delete(black_box(key.as_bytes())).unwrap();
        })
    });

    group.finish();
}

fn scan_across_shards(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    for i in 0..1000u32 {
        let key = format!("scan-{i:06}");
        engine.put(key.as_bytes(), b"value".to_vec()).unwrap();
    }

    c.bench_function("scan 100 keys across shards", |b| {
        b.iter(|| {
            black_box(engine.scan(b"scan-".to_vec(), Some(b"scan-\xff".to_vec()), 100).unwrap());
        })
    });
}

criterion_group!(benches, put_get_delete, scan_across_shards);
criterion_main!(benches);
