//! Diagnostics and profiler integration.
//!
//! This module provides:
//! - **Runtime diagnostics**: allocator-aware warnings and errors with codes
//! - **Log routing**: stderr, the `log` crate, or a custom [`DiagnosticSink`]
//! - **Profiler integration**: memory event callbacks and Tracy frame marks
//! - **Strict mode**: optional panic-on-error for CI
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                          |
//! |-------|----------------------------------|
//! | GA0xx | Device memory limits             |
//! | GA1xx | Lifetime / ownership violations  |
//! | GA3xx | Device capability fallbacks      |
//! | GA4xx | Shutdown and leak reports        |
//! | GA9xx | Internal errors                  |

pub mod kind;
pub mod emit;
pub mod strict;
pub mod macros;
mod profiler;

pub use kind::{Diagnostic, DiagnosticKind};
pub use emit::{emit, emit_with_context, set_sink, suppress_diagnostics, set_verbose, DiagnosticSink, CollectingSink};
pub use strict::{StrictMode, set_strict_mode, strict_mode, StrictModeGuard, init_from_env};

pub use kind::{GA001, GA002, GA101, GA102, GA103, GA301, GA401, GA402, GA403, GA404, GA901};

pub use profiler::{MemoryEvent, ProfilerCallback, ProfilerHooks};
