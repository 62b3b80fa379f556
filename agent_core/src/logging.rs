//! Subscriber setup for binaries hosting the rover runtime.

use crossbeam_channel::Receiver;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::diagnostic_stream::{DiagnosticForwardLayer, LogEnvelope};

/// Installs a compact stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Does nothing if a global subscriber is already installed.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Like [`init`], additionally forwarding `rover::*` warnings and errors into
/// the returned channel.
pub fn init_with_diagnostics() -> Receiver<LogEnvelope> {
    let (layer, receiver) = DiagnosticForwardLayer::channel(Level::WARN);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_filter(filter))
        .try_init();
    receiver
}
