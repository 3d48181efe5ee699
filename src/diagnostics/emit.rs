//! Diagnostic emission backend.
//!
//! Routes diagnostics to an installed sink, to the `log` crate (feature
//! `log`), or to stderr in debug builds and with the `diagnostics` feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::{should_panic, should_panic_on_warning};

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Global flag to enable verbose diagnostics.
static VERBOSE_DIAGNOSTICS: AtomicBool = AtomicBool::new(false);

/// Optional process-wide sink that replaces the default output.
static SINK: RwLock<Option<Arc<dyn DiagnosticSink>>> = RwLock::new(None);

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Enable verbose diagnostic output.
pub fn set_verbose(verbose: bool) {
    VERBOSE_DIAGNOSTICS.store(verbose, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Install a sink that receives every diagnostic instead of stderr/log.
///
/// Returns the previously installed sink.
pub fn set_sink(sink: Option<Arc<dyn DiagnosticSink>>) -> Option<Arc<dyn DiagnosticSink>> {
    let mut slot = SINK.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, sink)
}

fn installed_sink() -> Option<Arc<dyn DiagnosticSink>> {
    SINK.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Emit a diagnostic.
pub fn emit(diag: &Diagnostic) {
    dispatch(diag, None);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    dispatch(diag, Some(context));
}

fn dispatch(diag: &Diagnostic, context: Option<&str>) {
    if is_suppressed() {
        return;
    }

    if let Some(sink) = installed_sink() {
        sink.emit(diag, context);
    } else {
        #[cfg(feature = "log")]
        emit_to_log(diag, context);

        #[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
        emit_to_stderr(diag, context);
    }

    let fatal = match diag.kind {
        DiagnosticKind::Error => should_panic(),
        DiagnosticKind::Warning => should_panic_on_warning(),
        DiagnosticKind::Note | DiagnosticKind::Help => false,
    };
    if fatal {
        panic!(
            "[gpualloc][{}] {}\nContext: {}\nStrict mode enabled - diagnostics are fatal.",
            diag.code,
            diag.message,
            context.unwrap_or("-")
        );
    }
}

/// Internal: emit to stderr.
#[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
fn emit_to_stderr(diag: &Diagnostic, context: Option<&str>) {
    use std::io::Write;

    let mut stderr = std::io::stderr().lock();
    let verbose = VERBOSE_DIAGNOSTICS.load(Ordering::Relaxed);

    let _ = writeln!(
        stderr,
        "[gpualloc][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );

    if let Some(context) = context {
        let _ = writeln!(stderr, "  context: {}", context);
    }

    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }

    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }

    if verbose && diag.kind == DiagnosticKind::Error {
        let _ = writeln!(stderr, "  hint: set RUST_BACKTRACE=1 for a backtrace");
    }

    let _ = writeln!(stderr);
}

/// Emit a diagnostic using the log crate.
#[cfg(feature = "log")]
fn emit_to_log(diag: &Diagnostic, context: Option<&str>) {
    let context = context.unwrap_or("");
    match diag.kind {
        DiagnosticKind::Error => {
            log::error!(target: "gpualloc", "[{}] {} {}", diag.code, diag.message, context);
        }
        DiagnosticKind::Warning => {
            log::warn!(target: "gpualloc", "[{}] {} {}", diag.code, diag.message, context);
        }
        DiagnosticKind::Note | DiagnosticKind::Help => {
            log::info!(target: "gpualloc", "[{}] {} {}", diag.code, diag.message, context);
        }
    }

    if VERBOSE_DIAGNOSTICS.load(Ordering::Relaxed) {
        if let Some(note) = diag.note {
            log::debug!(target: "gpualloc", "  note: {}", note);
        }
        if let Some(help) = diag.help {
            log::debug!(target: "gpualloc", "  help: {}", help);
        }
    }
}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic and its optional runtime context.
    fn emit(&self, diag: &Diagnostic, context: Option<&str>);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<(Diagnostic, Option<String>)>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().iter().map(|(diag, _)| diag.clone()).collect()
    }

    /// Get every collected diagnostic carrying the given code.
    pub fn with_code(&self, code: &str) -> Vec<(Diagnostic, Option<String>)> {
        self.lock()
            .iter()
            .filter(|(diag, _)| diag.code == code)
            .cloned()
            .collect()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.lock()
            .iter()
            .any(|(diag, _)| diag.kind == DiagnosticKind::Error)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Diagnostic, Option<String>)>> {
        self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        self.lock().push((diag.clone(), context.map(str::to_owned)));
    }
}
