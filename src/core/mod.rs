//! Shared state threaded through every pool of one context.

pub mod frame_clock;

pub use frame_clock::FrameClock;
