use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use easel_store::{
    bounds_cache, PageProps, Record, RecordId, RecordProps, RecordType, ShapeKind, ShapeProps,
    Store, StoreSchema,
};

fn page() -> Record {
    Record::new(
        RecordId::new(RecordType::Page, "p1"),
        2,
        RecordProps::Page(PageProps {
            name: "Page 1".into(),
            index: 0,
        }),
    )
}

fn shape(key: &str, x: f64) -> Record {
    Record::new(
        RecordId::new(RecordType::Shape, key),
        2,
        RecordProps::Shape(ShapeProps {
            page: RecordId::new(RecordType::Page, "p1"),
            parent: None,
            x,
            y: 0.0,
            rotation: 0.0,
            opacity: 1.0,
            geo: ShapeKind::Rect { w: 50.0, h: 50.0 },
            asset: None,
        }),
    )
}

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("Store Transactions");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_shape", |b| {
        let mut store = Store::new(StoreSchema::canvas());
        store
            .transact(|txn| {
                txn.put(page());
                Ok(())
            })
            .unwrap();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let record = shape(&format!("s{n}"), n as f64);
            store
                .transact(|txn| {
                    txn.put(black_box(record.clone()));
                    Ok(())
                })
                .unwrap();
        })
    });

    group.finish();
}

fn bench_bounds_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("Computed Cache");
    group.throughput(Throughput::Elements(1));

    // A document with 1k shapes; read one cached bounds entry repeatedly —
    // this measures the memoized fast path, not recomputation.
    let mut store = Store::new(StoreSchema::canvas());
    store
        .transact(|txn| {
            txn.put(page());
            for i in 0..1000 {
                txn.put(shape(&format!("s{i}"), i as f64));
            }
            Ok(())
        })
        .unwrap();
    let mut cache = bounds_cache(&mut store);
    let target = RecordId::new(RecordType::Shape, "s500");

    group.bench_function("cached_bounds_read", |b| {
        b.iter(|| {
            let bounds = cache.get(&mut store, black_box(&target));
            black_box(bounds);
        })
    });

    group.bench_function("invalidate_and_recompute", |b| {
        let mut x = 0.0;
        b.iter(|| {
            x += 1.0;
            store
                .transact(|txn| {
                    txn.put(shape("s500", x));
                    Ok(())
                })
                .unwrap();
            let bounds = cache.get(&mut store, &target);
            black_box(bounds);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_transactions, bench_bounds_cache);
criterion_main!(benches);
