//! Criterion benchmarks for the segment bundler's row-completion hot path
//! (spec §4.7: every monitored device's readback for a point lands here
//! before that point's row can be published).
//!
//! Run with: cargo bench --bench bundler

use beamline_fabric::broker::memory::MemoryBroker;
use beamline_fabric::bundler::SegmentBundler;
use beamline_fabric::device::registry::DeviceRegistry;
use beamline_fabric::device::{AcquisitionConfig, AsyncUpdatePolicy, Device, ReadoutPriority, Schedule};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use uuid::Uuid;

fn bundler_with_devices(count: usize) -> (SegmentBundler<MemoryBroker>, Vec<String>) {
    let broker = Arc::new(MemoryBroker::new());
    let devices = Arc::new(DeviceRegistry::new(broker.clone()));
    let names: Vec<String> = (0..count).map(|i| format!("dev{i}")).collect();
    for name in &names {
        let mut device = Device::new(name.clone(), "generic");
        device.acquisition_config = AcquisitionConfig {
            readout_priority: ReadoutPriority::Monitored,
            schedule: Schedule::Sync,
            async_update: AsyncUpdatePolicy::Replace,
        };
        devices.upsert(device);
    }
    (SegmentBundler::new(broker, devices), names)
}

/// One full row (every monitored device delivering its reading for a
/// single point), the case that triggers a publish.
fn row_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundler_row_completion");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for device_count in [2usize, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("devices", device_count),
            &device_count,
            |b, &device_count| {
                b.iter_batched(
                    || {
                        let (bundler, names) = bundler_with_devices(device_count);
                        let scan_id = Uuid::new_v4();
                        bundler.open_scan(scan_id);
                        (bundler, names, scan_id)
                    },
                    |(bundler, names, scan_id)| {
                        runtime.block_on(async {
                            for (point_id, name) in names.iter().enumerate() {
                                let complete = bundler
                                    .record(scan_id, point_id as u64, name, black_box(serde_json::json!({"value": 1.0})))
                                    .await
                                    .unwrap();
                                black_box(complete);
                            }
                        });
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

/// A single device's reading arriving for a point no other device has
/// reported yet — the common case while a scan is still in flight, never
/// triggering a publish.
fn partial_row_record(c: &mut Criterion) {
    let (bundler, names) = bundler_with_devices(8);
    let scan_id = Uuid::new_v4();
    bundler.open_scan(scan_id);
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut point_id = 0u64;

    c.bench_function("bundler_partial_row_record", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let complete = bundler
                    .record(scan_id, point_id, &names[0], black_box(serde_json::json!({"value": 1.0})))
                    .await
                    .unwrap();
                black_box(complete);
            });
            point_id += 1;
        });
    });
}

criterion_group!(benches, row_completion, partial_row_record);
criterion_main!(benches);
