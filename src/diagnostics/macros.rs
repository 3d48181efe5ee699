//! Diagnostic macros.
//!
//! These macros provide a clean, rustc-like diagnostic experience.

/// Emit an ad-hoc diagnostic.
///
/// # Example
///
/// ```rust,ignore
/// ga_diagnostic!(
///     Warning,
///     code = "GA001",
///     message = "allocation count over device limit",
///     help = "raise the page size"
/// );
/// ```
#[macro_export]
macro_rules! ga_diagnostic {
    (
        $kind:ident,
        code = $code:expr,
        message = $msg:expr
        $(, note = $note:expr)?
        $(, help = $help:expr)?
    ) => {{
        let diag = $crate::diagnostics::Diagnostic {
            kind: $crate::diagnostics::DiagnosticKind::$kind,
            code: $code,
            message: $msg,
            note: None $(.or(Some($note)))?,
            help: None $(.or(Some($help)))?,
        };
        $crate::diagnostics::emit::emit(&diag);
    }};
}

/// Emit a predefined diagnostic by code.
///
/// # Example
///
/// ```rust,ignore
/// ga_emit!(GA001);
/// ```
#[macro_export]
macro_rules! ga_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
}

/// Emit a predefined diagnostic with formatted runtime context.
///
/// # Example
///
/// ```rust,ignore
/// ga_emit_ctx!(GA001, "count={} limit={}", count, limit);
/// ```
#[macro_export]
macro_rules! ga_emit_ctx {
    ($code:ident, $($arg:tt)+) => {{
        $crate::diagnostics::emit::emit_with_context(
            &$crate::diagnostics::$code,
            &format!($($arg)+),
        );
    }};
}

/// Check a precondition: emit the diagnostic if it does not hold, then
/// `debug_assert!` on it.
///
/// Release builds keep the diagnostic but skip the assertion.
#[macro_export]
macro_rules! ga_assert {
    ($cond:expr, $code:ident) => {{
        let ok: bool = $cond;
        if !ok {
            $crate::ga_emit!($code);
        }
        debug_assert!(ok, "[gpualloc][{}] {}", $crate::diagnostics::$code.code, $crate::diagnostics::$code.message);
    }};
    ($cond:expr, $code:ident, $($arg:tt)+) => {{
        let ok: bool = $cond;
        if !ok {
            $crate::ga_emit_ctx!($code, $($arg)+);
        }
        debug_assert!(ok, "[gpualloc][{}] {}", $crate::diagnostics::$code.code, $crate::diagnostics::$code.message);
    }};
}

pub use crate::{ga_assert, ga_diagnostic, ga_emit, ga_emit_ctx};
