// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Structured logging sink installed once at [`crate::init`].
//!
//! Replaces the original stack's variadic debug-print macro (spec.md §9):
//! callers implement [`LogSink`] and hand it to `init()`; formatting of the
//! message is deferred to the sink, never done eagerly by the caller of
//! `log()`. The default sink forwards to `tracing`, so a caller who wants
//! real output just installs a `tracing_subscriber::Subscriber` of their
//! choosing — this crate never installs one itself.

/// Severity categories, in the order the original stack's `TRDP_LOG_T` lists
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Error,
    Warning,
    Info,
    Debug,
}

/// Where in the source a log call originated, for sinks that want it.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

/// A pluggable log destination. Implementors decide formatting, filtering
/// and where the bytes end up; the engine only ever calls `log`.
pub trait LogSink: Send + Sync {
    fn log(&self, category: Category, location: Location, message: &str);
}

/// Default sink: forwards to `tracing` at the matching level.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, category: Category, location: Location, message: &str) {
        match category {
            Category::Error => {
                tracing::error!(file = location.file, line = location.line, "{}", message)
            }
            Category::Warning => {
                tracing::warn!(file = location.file, line = location.line, "{}", message)
            }
            Category::Info => {
                tracing::info!(file = location.file, line = location.line, "{}", message)
            }
            Category::Debug => {
                tracing::debug!(file = location.file, line = location.line, "{}", message)
            }
        }
    }
}

/// Emit a log record through the sink stored on a session or the process
/// default. Kept as a free function (rather than a macro) so the signature
/// stays uniform across call sites; formatting happens at the call site only
/// because `format!` is unavoidable to produce a `&str` — the sink itself
/// never re-formats.
pub fn emit(sink: &dyn LogSink, category: Category, location: Location, message: &str) {
    sink.log(category, location, message);
}

#[macro_export]
macro_rules! trdp_log {
    ($sink:expr, $category:expr, $($arg:tt)*) => {
        $crate::log::emit(
            $sink,
            $category,
            $crate::log::Location { file: file!(), line: line!() },
            &format!($($arg)*),
        )
    };
}
