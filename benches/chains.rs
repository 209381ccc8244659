use compound_core::alloc::Allocator;
use compound_core::{CompoundFile, MemDevice};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Write;

/// Benchmark raw chain allocation and release in the FAT.
fn bench_chain_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_alloc_free");

    group.bench_function("allocate_1k_chains", |b| {
        b.iter(|| {
            let mut alloc = Allocator::new(512);
            for _ in 0..1_000 {
                black_box(alloc.allocate(4));
            }
        });
    });

    group.bench_function("alloc_free_cycle", |b| {
        b.iter(|| {
            let mut alloc = Allocator::new(512);
            let mut starts = Vec::new();
            for _ in 0..200 {
                starts.push(alloc.allocate(8)[0]);
            }
            for (i, start) in starts.iter().enumerate() {
                if i % 2 == 0 {
                    alloc.free(*start).unwrap();
                }
            }
            for _ in 0..100 {
                black_box(alloc.allocate(8));
            }
        });
    });

    group.finish();
}

/// Benchmark writing streams through the container, both pools.
fn bench_stream_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_write");

    for size in [1_024_usize, 16 * 1024, 256 * 1024].iter() {
        group.bench_with_input(
            BenchmarkId::new("create_stream", format!("{}KB", size / 1024)),
            size,
            |b, &size| {
                let payload = vec![0xA5_u8; size];
                b.iter(|| {
                    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
                    let root = cfb.root().unwrap();
                    cfb.create_stream(&root, "bench", &payload).unwrap();
                    cfb.save().unwrap();
                });
            },
        );
    }

    group.bench_function("append_across_cutoff", |b| {
        let chunk = vec![0x5A_u8; 512];
        b.iter(|| {
            let cfb = CompoundFile::create(MemDevice::new()).unwrap();
            let root = cfb.root().unwrap();
            let entry = cfb.create_stream(&root, "grow", b"").unwrap();
            let mut stream = cfb.open_stream(&entry).unwrap();
            // 16 appends walk the stream from the mini pool into normal
            for _ in 0..16 {
                stream.write_all(&chunk).unwrap();
            }
            drop(stream);
            cfb.save().unwrap();
        });
    });

    group.finish();
}

/// Benchmark reopening a populated document.
fn bench_open(c: &mut Criterion) {
    let cfb = CompoundFile::create(MemDevice::new()).unwrap();
    let root = cfb.root().unwrap();
    for i in 0..100 {
        cfb.create_stream(&root, &format!("s{i:03}"), &vec![i as u8; 600])
            .unwrap();
    }
    cfb.save().unwrap();
    let bytes = cfb.into_device().unwrap().into_inner();

    c.bench_function("open_100_streams", |b| {
        b.iter(|| {
            let cfb =
                CompoundFile::open_reader(MemDevice::from_vec(bytes.clone())).unwrap();
            black_box(cfb.root().unwrap());
        });
    });
}

criterion_group!(benches, bench_chain_alloc_free, bench_stream_write, bench_open);
criterion_main!(benches);
