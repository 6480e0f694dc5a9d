//! Tunnel-traffic hand-off.

use tracing::info;

/// Collaborator receiving tunneled application payloads.
///
/// Fire-and-forget; the manager consumes no return value.
pub trait TrafficHandler: Send + Sync {
    fn on_tunnel_traffic(&self, sdp_id: u32, packet: &str);
}

/// Default handler: logs and drops the payload. The actual tunneled
/// payload transport lives outside this core.
#[derive(Debug, Default)]
pub struct LogTrafficHandler;

impl TrafficHandler for LogTrafficHandler {
    fn on_tunnel_traffic(&self, sdp_id: u32, packet: &str) {
        info!(sdp_id, bytes = packet.len(), "tunnel traffic received");
    }
}
