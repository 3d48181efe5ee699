//! Diagnostic kinds and the predefined allocator diagnostics.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - a precondition of the allocator was violated.
    Error,
    /// A warning - a soft limit was crossed or a lossy fallback was taken.
    Warning,
    /// Additional context, e.g. a statistics dump.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `GA0xx` - Device memory limits
/// - `GA1xx` - Lifetime and ownership violations
/// - `GA3xx` - Device capability fallbacks
/// - `GA4xx` - Shutdown and leak reports
/// - `GA9xx` - Internal errors
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "GA001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new note diagnostic.
    pub const fn note(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Note,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// GA0xx - Device memory limits
// =============================================================================

/// GA001: Device allocation count exceeds the hardware-reported limit.
pub const GA001: Diagnostic = Diagnostic::warning(
    "GA001",
    "device memory allocation count exceeds maxMemoryAllocationCount"
).with_note("some drivers tolerate this, but allocation may take a slow path or fail")
 .with_help("raise page and buffer allocation sizes in GpuAllocConfig so fewer raw allocations are needed");

/// GA002: Device memory allocation failed.
pub const GA002: Diagnostic = Diagnostic::error(
    "GA002",
    "device memory allocation failed"
).with_note("the device heap has no room left for a new page or buffer")
 .with_help("reduce resident resources or lower the page size for this memory type");

// =============================================================================
// GA1xx - Lifetime and ownership
// =============================================================================

/// GA101: Device memory freed twice.
pub const GA101: Diagnostic = Diagnostic::error(
    "GA101",
    "device memory allocation freed twice or freed by the wrong manager"
).with_note("the allocation handle is not tracked as live")
 .with_help("only free a DeviceMemoryAllocation once, through the manager that created it");

/// GA102: Suballocation released into a container that no longer exists.
pub const GA102: Diagnostic = Diagnostic::error(
    "GA102",
    "suballocation released to a stale or unknown container"
).with_note("the container's generation does not match the handle")
 .with_help("containers must outlive their suballocations; keep the owning pool alive");

/// GA103: Free range overlaps an existing free range.
pub const GA103: Diagnostic = Diagnostic::error(
    "GA103",
    "freed range overlaps an existing free range"
).with_note("this is a double free of a sub-range")
 .with_help("make sure each suballocation is released exactly once");

// =============================================================================
// GA3xx - Capability fallbacks
// =============================================================================

/// GA301: Memory type lookup fell back to weaker properties.
pub const GA301: Diagnostic = Diagnostic::warning(
    "GA301",
    "memory type fallback dropped HOST_CACHED from the requested properties"
).with_note("the preferred memory type is unavailable or its heap is exhausted")
 .with_help("CPU reads from this allocation will be uncached and slower");

// =============================================================================
// GA4xx - Shutdown and leaks
// =============================================================================

/// GA401: Live suballocations at shutdown.
pub const GA401: Diagnostic = Diagnostic::warning(
    "GA401",
    "container destroyed while suballocations are still live"
).with_note("the backing memory is released at shutdown regardless")
 .with_help("drop every buffer and page suballocation before shutting the allocator down");

/// GA402: Fences still held at shutdown.
pub const GA402: Diagnostic = Diagnostic::warning(
    "GA402",
    "fences still allocated when the fence manager was torn down"
).with_help("release every fence with release_fence() before shutdown");

/// GA403: Device memory still allocated at shutdown.
pub const GA403: Diagnostic = Diagnostic::warning(
    "GA403",
    "device memory allocations leaked at shutdown"
).with_help("enable the `debug` feature to record allocation backtraces");

/// GA404: Memory statistics dump.
pub const GA404: Diagnostic = Diagnostic::note(
    "GA404",
    "gpu memory statistics"
);

// =============================================================================
// GA9xx - Internal
// =============================================================================

/// GA901: Internal allocator error.
pub const GA901: Diagnostic = Diagnostic::error(
    "GA901",
    "internal allocator error"
).with_note("this indicates a bug in gpualloc");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_kinds() {
        assert_eq!(GA001.kind, DiagnosticKind::Warning);
        assert_eq!(GA101.kind, DiagnosticKind::Error);
        assert_eq!(GA404.kind.prefix(), "note");
        assert!(GA301.help.is_some());
    }
}
