//! Development-time tracing for debugging the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not part of the pipeline's product output.
//!
//! - **Pipeline log lines (`io/log_sink`)**: the padded "Checking on ... [ ok ]"
//!   lines and child output, gated by the pipeline verbosity and optionally
//!   teed to a log file.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. If unset, defaults to `warn`, raised to `info`
/// for verbosity >= 5 and `debug` for verbosity >= 9.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=stagepipe=debug stagepipe run pipeline.toml subj01
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0..=4 => "warn",
        5..=8 => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_default_level() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(5), "info");
        assert_eq!(default_directive(9), "debug");
    }
}
