//! Public API for gpualloc.
//!
//! Most users only need [`GpuMemory`](context::GpuMemory) and
//! [`GpuAllocConfig`](config::GpuAllocConfig).

pub mod config;
pub mod context;
pub mod stats;
