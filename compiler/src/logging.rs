//! Logging configuration for the optimizer
//!
//! Library code emits records through `tracing` (analyses and passes) and
//! `log` (pass manager, CLI); `tracing`'s `log` feature forwards both to the
//! `env_logger` backend initialized here.
//!
//! # Usage
//!
//! ```rust,ignore
//! use compiler::logging;
//!
//! // Initialize with default level (Warn)
//! logging::init();
//!
//! // Or initialize from RUST_LOG environment variable
//! logging::init_from_env();
//!
//! // Or initialize with a specific level
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `error!` - Actual errors that should always be shown
//! - `warn!` - Verification failures
//! - `info!` - Pipeline progress (one line per function and pass)
//! - `debug!` - Individual decisions ("remove NullCheck $5 (dominated)")
//! - `trace!` - Analysis dumps (alias graph, bounds ranges)
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=warn checkopt optimize graph.json   # Default, quiet output
//! RUST_LOG=debug checkopt optimize graph.json  # Every decision
//! RUST_LOG=compiler::ir::alias_analysis=trace checkopt alias graph.json
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with sensible defaults (Warn level).
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// This only initializes once; subsequent calls are no-ops. `RUST_LOG`
/// filters still apply on top of `level`.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = Builder::new();
        builder.filter_level(level);
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from the RUST_LOG environment variable.
///
/// If RUST_LOG is not set, defaults to Warn level.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests.
///
/// ```rust,ignore
/// #[test]
/// fn test_something() {
///     compiler::logging::init_test();
///     // Test code...
/// }
/// ```
pub fn init_test() {
    // try_init() doesn't panic if already initialized
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

/// Whether one of the `init*` entry points (other than `init_test`) ran.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
        init_test();
    }

    #[test]
    fn test_tracing_records_reach_the_logger() {
        init_test();
        tracing::debug!(target: "compiler::ir::checks_elimination", "remove {} ({})", "$5", "dominated");
        log::trace!("pass manager record");
    }
}
