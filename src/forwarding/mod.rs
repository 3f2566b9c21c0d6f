//! Port Forwarding Module
//!
//! Local port forwarding over `direct-tcpip` channels of one SSH transport.

mod events;
mod local;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{ForwardEvent, ForwardEventEmitter};
pub use local::{
    start_local_forward, ForwardDialer, ForwardStream, LocalForward, LocalForwardHandle,
};
pub use manager::{ForwardRule, ForwardStats, ForwardStatus, ForwardingManager, TunnelKey};
