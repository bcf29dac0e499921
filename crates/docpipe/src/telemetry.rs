//! Tracing setup for binaries and tests that embed the engine.
//!
//! The crate emits spans through `tracing` in the pipeline and plain `log`
//! records everywhere else; [`init`] installs one subscriber that receives
//! both. Embedding applications with their own subscriber can skip this
//! entirely.

use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Output encoding of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Installs the global subscriber, filtered by `RUST_LOG` when set and by
/// `default_directives` otherwise. Returns `false` when a logger or
/// subscriber is already installed; the existing one is kept.
pub fn init(default_directives: &str, format: LogFormat) -> bool {
    if LogTracer::init().is_err() {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let installed = match format {
        LogFormat::Text => {
            let subscriber = Registry::default().with(filter).with(fmt::layer());
            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
        LogFormat::Json => {
            let subscriber = Registry::default().with(filter).with(fmt::layer().json());
            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
    };

    if installed {
        log::info!("docpipe v{} logging initialized", env!("CARGO_PKG_VERSION"));
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_keeps_the_first_subscriber() {
        assert!(init("docpipe=debug", LogFormat::Text));
        assert!(!init("docpipe=trace", LogFormat::Json));

        // Both macro families must route through the installed subscriber
        // without panicking.
        tracing::info!(check = "tracing", "subscriber receives tracing events");
        log::info!("subscriber receives bridged log records");
    }
}
