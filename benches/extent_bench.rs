use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use uuid::Uuid;
use vmadedup::archive::optimize_stream;
use vmadedup::{ArchiveHeader, ArchiveWriter, Extent, ReorderConfig, CLUSTER_SIZE};

fn bench_extent(c: &mut Criterion) {
    let mut data = vec![0u8; CLUSTER_SIZE];
    for (i, b) in data.iter_mut().enumerate().step_by(3) {
        *b = i as u8;
    }
    let sparse = {
        let mut d = vec![0u8; CLUSTER_SIZE];
        d[0] = 1;
        d
    };

    c.bench_function("extent_pack_59_dense", |b| {
        b.iter(|| {
            let mut e = Extent::new([1u8; 16]);
            for i in 0..59 {
                e.add(1, i, black_box(&data));
            }
            e.serialize()
        })
    });

    c.bench_function("extent_pack_59_sparse", |b| {
        b.iter(|| {
            let mut e = Extent::new([1u8; 16]);
            for i in 0..59 {
                e.add(1, i, black_box(&sparse));
            }
            e.serialize()
        })
    });
}

fn interleaved_archive(clusters: u32) -> Vec<u8> {
    let mut h = ArchiveHeader::new(Uuid::from_bytes([9u8; 16]), 0);
    let size = clusters as u64 * CLUSTER_SIZE as u64;
    h.add_device("drive-scsi0", size).unwrap();
    h.add_device("drive-scsi1", size).unwrap();
    let mut w = ArchiveWriter::new(Vec::new(), h).unwrap();
    let block = [7u8; 4096];
    let tail = clusters - 40;
    for c in 0..tail {
        w.add_cluster(1, c, &block).unwrap();
    }
    for i in 0..40 {
        w.add_cluster(2, i, &block).unwrap();
        w.add_cluster(1, tail + i, &block).unwrap();
    }
    for c in 40..clusters {
        w.add_cluster(2, c, &block).unwrap();
    }
    w.finish().unwrap().0
}

fn bench_optimize(c: &mut Criterion) {
    let archive = interleaved_archive(1024);
    c.bench_function("optimize_2x1024_clusters", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            optimize_stream(Cursor::new(black_box(&archive)), &mut out, ReorderConfig::default()).unwrap();
            out
        })
    });
}

criterion_group!(benches, bench_extent, bench_optimize);
criterion_main!(benches);
