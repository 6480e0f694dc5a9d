//! sdpc-manager: Tunnel manager core for the SDP client.
//!
//! Turns a granted "access to service X" decision into a live,
//! authenticated tunnel to the gateway hosting that service, and
//! multiplexes further service requests onto tunnels that already
//! exist. A single manager task owns all tunnel state; the IPC pipe and
//! the control channel reach it through a command channel.

pub mod ipc;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod traffic;
pub mod tunnel;

// Re-export commonly used items at crate root.
pub use manager::{Command, ManagerConfig, ManagerHandle, TunnelManager};
pub use registry::{KeyKind, Table, TableKey, TunnelRegistry};
pub use resolver::{GatewayAddr, ServiceResolver, StanzaResolver};
pub use traffic::{LogTrafficHandler, TrafficHandler};
pub use tunnel::{ConnState, ServiceEntry, TunnelRecord};
