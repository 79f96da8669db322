//! Structured logging setup.
//!
//! Logs go to stderr so that `--json` output on stdout stays machine-parseable.
//! `RUST_LOG` overrides the verbosity chosen on the command line, e.g.
//! `RUST_LOG=sight_match::search=debug`.

use std::sync::OnceLock;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "sight_match=info",
        1 => "sight_match=debug",
        _ => "sight_match=trace",
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(verbosity: u8) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbosity > 0)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()));

        // Another subscriber (e.g. a test harness) may already be installed.
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_directive() {
        assert_eq!(default_directive(0), "sight_match=info");
        assert_eq!(default_directive(1), "sight_match=debug");
        assert_eq!(default_directive(4), "sight_match=trace");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(0);
        init_logging(2);
        tracing::info!("still logging");
    }
}
