//! SSH module - handles SSH connections and sessions
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Password (with keyboard-interactive fallback) and key authentication
//! - Host key trust via a fingerprint store and a pluggable decision
//! - Single-owner transport handle driven through [`HandleController`]
//! - Interactive shell relay with session-end detection
//! - Keepalive probes
//! - Connection registry with automatic removal of ended connections

mod client;
mod config;
pub mod connection;
pub mod connection_registry;
mod error;
mod handle_owner;
pub mod keepalive;
pub mod known_hosts;
pub mod session;
pub mod trust;

pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig, DEFAULT_CONNECT_TIMEOUT_SECS};
pub use connection::{ConnectionInfo, SshConnection};
pub use connection_registry::{ConnectionRegistry, ManagedConnection};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use keepalive::{Keepalive, LivenessProbe};
pub use known_hosts::{HostKeyStatus, KnownHostsStore};
pub use session::{
    open_shell, run_command, LogoutDetector, PreparedShell, SessionEndDetector, ShellHandle,
    ShellSink, ShellStream,
};
pub use trust::{
    ChannelTrustDecision, HostKeyPrompt, HostKeyVerifier, TrustDecision, TrustRequest,
    DEFAULT_PROMPT_TIMEOUT,
};
