//! Structured log events.
//!
//! Every event goes to target "tessera" and carries two leading fields that
//! the macros make mandatory: the emitting `component` and a snake_case
//! `event` name. The library never installs a subscriber.
//!
//! Components in use: `array`, `directory`, `writer`, `reader`,
//! `consolidator`, `vacuum`. Fragment names are logged with `%`, never whole
//! URI lists.

/// Target for all tessera log events.
pub(crate) const TESSERA_TARGET: &str = "tessera";

/// Emit one event at `$level` with the mandatory leading fields.
macro_rules! emit {
    ($level:ident, $component:literal, $event:literal $(, $($field:tt)*)?) => {
        ::tracing::$level!(
            target: $crate::observability::TESSERA_TARGET,
            component = $component,
            event = $event
            $(, $($field)*)?
        )
    };
}

/// Info-level event: state changes that persist, such as commits.
///
/// ```ignore
/// log_info!(
///     "consolidator",
///     "consolidation_step",
///     fragment = %name,
///     inputs = inputs.len(),
/// );
/// ```
macro_rules! log_info {
    ($($args:tt)*) => {
        $crate::observability::emit!(info, $($args)*)
    };
}

/// Debug-level event: per-pass progress.
macro_rules! log_debug {
    ($($args:tt)*) => {
        $crate::observability::emit!(debug, $($args)*)
    };
}

/// Warn-level event: recoverable trouble.
macro_rules! log_warn {
    ($($args:tt)*) => {
        $crate::observability::emit!(warn, $($args)*)
    };
}

/// Error-level event: an operation gave up.
macro_rules! log_error {
    ($($args:tt)*) => {
        $crate::observability::emit!(error, $($args)*)
    };
}

pub(crate) use emit;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
