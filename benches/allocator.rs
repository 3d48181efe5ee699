//! Benchmarks for gpualloc.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpualloc::{
    BufferUsage, DummyDevice, FreeListAllocator, GpuAllocConfig, GpuMemory, GpuMemoryIntent,
    MemoryPropertyFlags, MemoryRequirements, NativeHandle,
};
use std::sync::Arc;

fn memory() -> GpuMemory {
    let config = GpuAllocConfig::default().with_host_visible_page_size(1 << 20);
    match GpuMemory::new(Arc::new(DummyDevice::new()), config) {
        Ok(memory) => memory,
        Err(err) => panic!("failed to create allocator: {}", err),
    }
}

fn bench_free_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_list");

    for count in [16u64, 256, 1024] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("alloc_free_interleaved", count), &count, |b, &count| {
            let mut list = FreeListAllocator::new(64 << 20);
            let mut live = Vec::with_capacity(count as usize);
            b.iter(|| {
                for i in 0..count {
                    if let Some(placed) = list.try_allocate(64 + (i % 7) * 48, 256) {
                        live.push(placed);
                    }
                }
                // Free every other allocation first to leave holes.
                for placed in live.iter().step_by(2) {
                    list.free(placed.range_offset, placed.allocated_size);
                }
                for placed in live.iter().skip(1).step_by(2) {
                    list.free(placed.range_offset, placed.allocated_size);
                }
                live.clear();
                black_box(list.ranges().len());
            })
        });
    }

    group.finish();
}

fn bench_buffer_pool(c: &mut Criterion) {
    let memory = memory();
    let mut group = c.benchmark_group("buffer_pool");

    group.bench_function("uniform_256b_alloc_drop", |b| {
        // Keep one allocation alive so the buffer is not destroyed each iteration.
        let _anchor = memory.allocate_buffer(16, BufferUsage::UNIFORM_BUFFER, MemoryPropertyFlags::HOST_VISIBLE);
        b.iter(|| {
            let sub = memory.allocate_buffer(256, BufferUsage::UNIFORM_BUFFER, MemoryPropertyFlags::HOST_VISIBLE);
            black_box(sub)
        })
    });

    group.bench_function("vertex_4kb_100x", |b| {
        b.iter(|| {
            let subs: Vec<_> = (0..100)
                .filter_map(|_| {
                    memory
                        .allocate_buffer(4096, BufferUsage::VERTEX_BUFFER, MemoryPropertyFlags::DEVICE_LOCAL)
                        .ok()
                })
                .collect();
            black_box(subs)
        })
    });

    group.finish();
}

fn bench_resource_heap(c: &mut Criterion) {
    let memory = memory();
    let requirements = MemoryRequirements {
        size: 64 << 10,
        alignment: 256,
        memory_type_bits: u32::MAX,
    };

    c.bench_function("resource_heap_64kb_alloc_drop", |b| {
        let _anchor = memory.allocate_memory(&requirements, GpuMemoryIntent::DeviceOnly);
        b.iter(|| black_box(memory.allocate_memory(&requirements, GpuMemoryIntent::DeviceOnly)))
    });
}

fn bench_scratch(c: &mut Criterion) {
    let memory = memory();

    c.bench_function("scratch_256b_1000x_then_tick", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(memory.alloc_scratch(256, 16).ok());
            }
            memory.tick();
        })
    });
}

fn bench_frame_maintenance(c: &mut Criterion) {
    let memory = memory();
    let cmd = memory.create_cmd_buffer();

    c.bench_function("tick_with_100_deferred", |b| {
        b.iter(|| {
            for i in 0..100 {
                memory.defer_destroy_for(&cmd, NativeHandle::ImageView(i));
            }
            cmd.mark_signaled();
            black_box(memory.tick())
        })
    });
}

criterion_group!(
    benches,
    bench_free_list,
    bench_buffer_pool,
    bench_resource_heap,
    bench_scratch,
    bench_frame_maintenance,
);
criterion_main!(benches);
