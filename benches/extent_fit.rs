//! Benchmark for capacity negotiation over fragmented drives

use array_control_plane::capacity::{
    CapacityNegotiator, ExtentLayout, ObjectExtents, RaidType, RequestedCapacity,
    StandardRaidGeometry, UsedExtent,
};
use array_control_plane::ObjectId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

const DRIVE_BLOCKS: u64 = 0x1000_0000;

/// Members with `holes` consumed ranges each, staggered per drive
fn fragmented_layout(width: u32, holes: u32) -> (ExtentLayout, Vec<ObjectId>) {
    let mut layout = ExtentLayout::new();
    let mut members = Vec::with_capacity(width as usize);
    let stride = DRIVE_BLOCKS / (holes as u64 + 1);
    for m in 0..width {
        let id = ObjectId(0x200 + m);
        let used = (0..holes)
            .map(|h| UsedExtent {
                offset: h as u64 * stride + m as u64 * 0x100,
                capacity: stride / 2,
                client_index: h,
            })
            .collect();
        layout.insert(ObjectExtents::fresh(id, DRIVE_BLOCKS, 0).with_used(used));
        members.push(id);
    }
    (layout, members)
}

fn bench_extent_fits(c: &mut Criterion) {
    let negotiator = CapacityNegotiator::new(Arc::new(StandardRaidGeometry::default()));
    let mut group = c.benchmark_group("extent_fit");
    group.throughput(Throughput::Elements(1));

    for holes in [0u32, 8, 64] {
        let (layout, members) = fragmented_layout(16, holes);
        group.bench_with_input(BenchmarkId::new("width_16", holes), &holes, |b, _| {
            b.iter(|| {
                let _ = negotiator.extent_fits(
                    black_box(&layout),
                    black_box(&members),
                    black_box(0x10_0000),
                    false,
                );
            });
        });
    }

    group.finish();
}

fn bench_raid_group_capacity(c: &mut Criterion) {
    let negotiator = CapacityNegotiator::new(Arc::new(StandardRaidGeometry::default()));
    let mut group = c.benchmark_group("extent_fit");
    let available = vec![DRIVE_BLOCKS; 16];

    group.bench_function("raid6_unspecified", |b| {
        b.iter(|| {
            let _ = negotiator.calculate_raid_group_capacity(
                black_box(RaidType::Raid6),
                16,
                RequestedCapacity::Unspecified,
                black_box(&available),
            );
        });
    });

    group.finish();
}

criterion_group!(benches, bench_extent_fits, bench_raid_group_capacity);
criterion_main!(benches);
