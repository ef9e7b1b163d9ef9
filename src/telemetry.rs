use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

pub const DEFAULT_DIRECTIVE: &str = "installments=info";

/// Installs the global subscriber. Logs go to stderr so stdout stays
/// machine-readable. `RUST_LOG` overrides the default filter.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(
            std::env::var(EnvFilter::DEFAULT_ENV)
                .unwrap_or_else(|_| DEFAULT_DIRECTIVE.to_string()),
        );

    // a second init (tests, embedding hosts) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}
