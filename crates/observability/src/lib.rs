//! Tracing/logging setup shared by every MarketPulse binary.

/// Initialize process-wide logging using `LOG_FORMAT` (`json` | `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::LogFormat;
