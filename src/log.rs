//! Process logger installation.
//!
//! The framework logs through the `tracing` facade everywhere; this module
//! only installs a default subscriber. Embedders that want a different sink
//! install their own subscriber before calling [`init`] (the install here is
//! a no-op once a global subscriber exists).

use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::conf;

/// Install the default fmt subscriber, filtered by the configured log level
/// and writing to the configured log path (stderr when unset).
pub fn init() {
    let cfg = conf::get();

    let filter = EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &cfg.log_path {
        Some(path) => {
            let file = match File::create(path) {
                Ok(f) => f,
                Err(e) => panic!("open log file {}: {}", path.display(), e),
            };
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init();
        }
    }
}
