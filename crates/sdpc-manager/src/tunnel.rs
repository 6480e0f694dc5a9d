//! Tunnel records and their per-service request lists.

use std::time::Instant;

use tokio::net::TcpStream;

use crate::registry::{KeyKind, TableKey};

/// Connection state of a tunnel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One requested or opened service riding a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: u32,
    pub idp_id: u32,
    pub id_token: String,
    /// Whether the service-request message has gone out on the wire.
    pub request_sent: bool,
}

/// One tunnel per (gateway IP, this client).
///
/// Records are owned by the registry inside the manager task.
/// Asynchronous connect and retry operations capture the record's
/// gateway-IP key, never a reference, and re-resolve it when they
/// complete; a miss means the record was torn down and the completion
/// is a no-op.
#[derive(Debug)]
pub struct TunnelRecord {
    /// Owning SDP id.
    pub sdp_id: u32,
    /// The gateway's public IP, also the requested-table key.
    pub gateway_ip: String,
    /// Negotiated tunnel IP, once the gateway assigns one.
    pub tunnel_ip: Option<String>,
    pub gateway_port: u16,
    /// Identity provider backing the tunnel's primary authentication.
    pub idp_id: u32,
    pub id_token: String,
    /// Services asked for on this tunnel, in request order.
    pub services_requested: Vec<ServiceEntry>,
    /// Services the gateway has granted.
    pub services_opened: Vec<ServiceEntry>,
    pub state: ConnState,
    /// Connection attempts made so far.
    pub attempts: u32,
    pub created_at: Instant,
    /// When the next retry is due, while one is scheduled.
    pub next_retry_at: Option<Instant>,
    /// Live transport once connected.
    pub transport: Option<TcpStream>,
}

impl TunnelRecord {
    pub fn new(
        sdp_id: u32,
        gateway_ip: String,
        gateway_port: u16,
        idp_id: u32,
        id_token: String,
    ) -> Self {
        Self {
            sdp_id,
            gateway_ip,
            tunnel_ip: None,
            gateway_port,
            idp_id,
            id_token,
            services_requested: Vec::new(),
            services_opened: Vec::new(),
            state: ConnState::Disconnected,
            attempts: 0,
            created_at: Instant::now(),
            next_retry_at: None,
            transport: None,
        }
    }

    /// The registry key of the given kind for this record.
    pub fn key(&self, kind: KeyKind) -> TableKey {
        match kind {
            KeyKind::SdpId => TableKey::SdpId(self.sdp_id),
            KeyKind::GatewayIp => TableKey::GatewayIp(self.gateway_ip.clone()),
        }
    }

    pub fn has_requested_service(&self, service_id: u32) -> bool {
        self.services_requested
            .iter()
            .any(|s| s.service_id == service_id)
    }

    /// Append a service to the requested list, preserving request
    /// order. Returns false (and appends nothing) if the service is
    /// already queued; the list itself does not deduplicate.
    pub fn add_requested_service(
        &mut self,
        service_id: u32,
        idp_id: u32,
        id_token: &str,
        request_sent: bool,
    ) -> bool {
        if self.has_requested_service(service_id) {
            return false;
        }
        self.services_requested.push(ServiceEntry {
            service_id,
            idp_id,
            id_token: id_token.to_string(),
            request_sent,
        });
        true
    }

    /// Move a requested entry to the opened list once the gateway
    /// grants it.
    pub fn mark_service_opened(&mut self, service_id: u32) -> bool {
        match self
            .services_requested
            .iter()
            .position(|s| s.service_id == service_id)
        {
            Some(pos) => {
                let entry = self.services_requested.remove(pos);
                self.services_opened.push(entry);
                true
            }
            None => false,
        }
    }

    /// Drop a requested entry the gateway rejected.
    pub fn mark_service_rejected(&mut self, service_id: u32) -> bool {
        match self
            .services_requested
            .iter()
            .position(|s| s.service_id == service_id)
        {
            Some(pos) => {
                self.services_requested.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TunnelRecord {
        TunnelRecord::new(1, "10.0.0.5".to_string(), 8282, 1, "tok-A".to_string())
    }

    #[test]
    fn new_record_starts_disconnected() {
        let rec = record();
        assert_eq!(rec.state, ConnState::Disconnected);
        assert_eq!(rec.attempts, 0);
        assert!(rec.services_requested.is_empty());
        assert!(rec.transport.is_none());
    }

    #[test]
    fn services_keep_request_order_and_dedupe() {
        let mut rec = record();
        assert!(rec.add_requested_service(7, 1, "tok-A", false));
        assert!(rec.add_requested_service(9, 1, "tok-B", false));
        assert!(!rec.add_requested_service(7, 1, "tok-A", false));

        let ids: Vec<u32> = rec.services_requested.iter().map(|s| s.service_id).collect();
        assert_eq!(ids, vec![7, 9]);
    }

    #[test]
    fn mark_opened_moves_entry() {
        let mut rec = record();
        rec.add_requested_service(7, 1, "tok-A", true);
        assert!(rec.mark_service_opened(7));
        assert!(rec.services_requested.is_empty());
        assert_eq!(rec.services_opened.len(), 1);
        assert!(!rec.mark_service_opened(7));
    }

    #[test]
    fn mark_rejected_drops_entry() {
        let mut rec = record();
        rec.add_requested_service(7, 1, "tok-A", true);
        assert!(rec.mark_service_rejected(7));
        assert!(rec.services_requested.is_empty());
        assert!(rec.services_opened.is_empty());
        assert!(!rec.mark_service_rejected(7));
    }
}
