//! Tree throughput benchmarks: sequential and random stores, point
//! loads, and cursor scans.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;

use burldb::{Database, Options};

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(
        Options::new(dir.path().join("bench.burl"))
            .page_size(4096)
            .cache_bytes(64 * 1024 * 1024),
    )
    .unwrap()
}

fn bench_store_sequential(c: &mut Criterion) {
    c.bench_function("store_sequential_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = open_db(&dir);
                (dir, db)
            },
            |(dir, db)| {
                let tree = db.open_tree(b"bench").unwrap();
                for i in 0..10_000u64 {
                    tree.store(None, &i.to_be_bytes(), b"value-payload-32-bytes-of-data!!")
                        .unwrap();
                }
                drop(dir);
            },
            BatchSize::PerIteration,
        );
    });
}

fn bench_load_hot(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"bench").unwrap();
    for i in 0..10_000u64 {
        tree.store(None, &i.to_be_bytes(), b"value-payload-32-bytes-of-data!!")
            .unwrap();
    }

    let mut i = 0u64;
    c.bench_function("load_hot", |b| {
        b.iter(|| {
            i = (i.wrapping_mul(6364136223846793005).wrapping_add(1)) % 10_000;
            black_box(tree.load(None, &i.to_be_bytes()).unwrap());
        });
    });
}

fn bench_cursor_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"bench").unwrap();
    for i in 0..10_000u64 {
        tree.store(None, &i.to_be_bytes(), b"v").unwrap();
    }

    c.bench_function("cursor_scan_10k", |b| {
        b.iter(|| {
            let mut cursor = tree.cursor();
            cursor.first().unwrap();
            let mut n = 0u64;
            while cursor.key().is_some() {
                n += 1;
                cursor.next().unwrap();
            }
            assert_eq!(n, 10_000);
        });
    });
}

fn bench_transactional_store(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let tree = db.open_tree(b"bench").unwrap();

    let mut i = 0u64;
    c.bench_function("txn_store_commit", |b| {
        b.iter(|| {
            i += 1;
            let mut txn = db.begin().unwrap();
            tree.store(Some(&mut txn), &i.to_be_bytes(), b"payload").unwrap();
            txn.commit().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_store_sequential,
    bench_load_hot,
    bench_cursor_scan,
    bench_transactional_store,
);
criterion_main!(benches);
