//! Vulkan backend for GPU allocation
//!
//! This module implements [`GpuDevice`](crate::gpu::GpuDevice) over an
//! `ash::Device`.

pub mod device;

pub use device::AshDevice;
