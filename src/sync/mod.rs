//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot mutexes, plus atomic
//! counters used for statistics that are read without taking a pool lock.

pub(crate) mod atomics;
pub(crate) mod mutex;
