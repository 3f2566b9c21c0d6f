//! Shellport - remote-access client core
//!
//! One authenticated SSH transport carries an interactive shell, local port
//! forwards and a managed SFTP transfer queue. Closing the connection tears
//! all of them down.

pub mod config;
pub mod forwarding;
pub mod sftp;
pub mod ssh;
pub mod state;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::CoreConfig;
pub use ssh::{ConnectionRegistry, SshConfig, SshConnection, SshError};
pub use state::CoreState;

#[cfg(debug_assertions)]
const DEFAULT_LOG_FILTER: &str = "info,shellport=debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_FILTER: &str = "info";

/// Initialize logging. `RUST_LOG` wins over the built-in filter.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
