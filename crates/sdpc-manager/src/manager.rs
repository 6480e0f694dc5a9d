//! The tunnel manager task.
//!
//! A single task owns the registry and every live transport, and is the
//! only mutator of tunnel records. The IPC pipe, the control channel,
//! and the manager's own asynchronous connect/retry completions all
//! reach it through one command channel, which serializes access
//! without a lock. Completions carry the record's gateway-IP key, never
//! a reference; the record is re-resolved at fire time and a miss is a
//! logged no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sdpc_proto::{
    encode, Action, ProtocolMessage, SdpError, SdpResult, INITIAL_RETRY_DELAY_SECS,
    MAX_CON_ATTEMPTS,
};

use crate::registry::{Table, TableKey, TunnelRegistry};
use crate::resolver::ServiceResolver;
use crate::traffic::TrafficHandler;
use crate::tunnel::{ConnState, TunnelRecord};

/// Manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// This client's SDP id, used when a message does not carry one.
    pub sdp_id: u32,
    /// Connection attempts before a tunnel is abandoned.
    pub max_con_attempts: u32,
    /// Base retry delay; the retry after failed attempt N waits
    /// `base * N`.
    pub retry_delay_base: Duration,
    /// Command channel depth.
    pub command_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sdp_id: 0,
            max_con_attempts: MAX_CON_ATTEMPTS,
            retry_delay_base: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            command_buffer: 256,
        }
    }
}

/// Commands delivered to the manager task.
#[derive(Debug)]
pub enum Command {
    /// A decoded control message from the IPC pipe or control channel.
    Dispatch(ProtocolMessage),
    /// Outcome of an asynchronous connect attempt.
    ConnectFinished {
        gateway_ip: String,
        result: std::io::Result<TcpStream>,
    },
    /// A scheduled retry delay elapsed.
    RetryDue { gateway_ip: String },
    /// Stop the manager loop.
    Shutdown,
}

/// Clonable handle for reaching the manager task.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    /// Feed a decoded control message into the manager.
    pub async fn dispatch(&self, msg: ProtocolMessage) -> SdpResult<()> {
        self.tx
            .send(Command::Dispatch(msg))
            .await
            .map_err(|_| SdpError::Transport("manager task is gone".into()))
    }

    /// Ask the manager loop to stop.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// The tunnel manager.
pub struct TunnelManager {
    config: ManagerConfig,
    registry: TunnelRegistry,
    resolver: Arc<dyn ServiceResolver>,
    traffic: Arc<dyn TrafficHandler>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
}

impl TunnelManager {
    pub fn new(
        config: ManagerConfig,
        resolver: Arc<dyn ServiceResolver>,
        traffic: Arc<dyn TrafficHandler>,
    ) -> (Self, ManagerHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let handle = ManagerHandle { tx: tx.clone() };
        let manager = Self {
            config,
            registry: TunnelRegistry::new(),
            resolver,
            traffic,
            rx,
            tx,
        };
        (manager, handle)
    }

    /// Run the command loop until a shutdown command arrives.
    pub async fn run(mut self) {
        info!("tunnel manager started");
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Dispatch(msg) => self.handle_message(msg).await,
                Command::ConnectFinished { gateway_ip, result } => {
                    self.on_connect_finished(gateway_ip, result).await;
                }
                Command::RetryDue { gateway_ip } => self.on_retry_due(gateway_ip),
                Command::Shutdown => break,
            }
        }
        info!("tunnel manager stopped");
    }

    /// Action dispatch for one decoded control message.
    async fn handle_message(&mut self, msg: ProtocolMessage) {
        match msg.action {
            Action::ServiceRequest => {
                let Some(service_id) = msg.service_id else {
                    warn!("service request carried no service id");
                    return;
                };
                let sdp_id = msg.sdp_id.unwrap_or(self.config.sdp_id);
                let idp_id = msg.idp_id.unwrap_or_default();
                let id_token = msg.id_token.unwrap_or_default();
                self.handle_service_request(sdp_id, service_id, idp_id, &id_token)
                    .await;
            }

            Action::ServiceGranted => match msg.service_id {
                Some(service_id) => self.mark_service_outcome(service_id, true),
                None => debug!("service granted with no service id, no action taken"),
            },
            Action::ServiceDenied => match msg.service_id {
                Some(service_id) => self.mark_service_outcome(service_id, false),
                None => debug!("service denied with no service id, no action taken"),
            },

            // The upstream protocol defines the authn actions but this
            // client build does not act on them yet; they are explicit
            // extension points, not dropped messages.
            Action::AuthnRequest => {
                debug!(sdp_id = ?msg.sdp_id, "authn request, no action taken");
            }
            Action::AuthnAccepted => {
                debug!(tunnel_ip = ?msg.tunnel_ip, "authn accepted, no action taken");
            }
            Action::AuthnRejected => {
                debug!(sdp_id = ?msg.sdp_id, "authn rejected, no action taken");
            }

            Action::TunnelTraffic => {
                let sdp_id = msg.sdp_id.unwrap_or_default();
                let packet = msg.packet.unwrap_or_default();
                self.traffic.on_tunnel_traffic(sdp_id, &packet);
            }
            Action::BadMessage => {
                error!("received notice of a bad message");
            }
            Action::Unknown(token) => {
                error!(action = %token, "received message with unhandled action");
            }
        }
    }

    /// Satisfy one service request: resolve the owning gateway, then
    /// reuse, queue on, or create the tunnel record for it.
    async fn handle_service_request(
        &mut self,
        sdp_id: u32,
        service_id: u32,
        idp_id: u32,
        id_token: &str,
    ) {
        let addr = match self.resolver.resolve(service_id) {
            Ok(addr) => addr,
            Err(e) => {
                error!(service_id, error = %e, "service lookup failed");
                return;
            }
        };
        info!(service_id, gateway = %addr.ip, port = addr.port, "service id mapped to gateway");

        let key = TableKey::GatewayIp(addr.ip.clone());
        let existing_state = self
            .registry
            .find(Table::Requested, &key)
            .map(|record| record.state);

        match existing_state {
            None => {
                let mut record = TunnelRecord::new(
                    sdp_id,
                    addr.ip.clone(),
                    addr.port,
                    idp_id,
                    id_token.to_string(),
                );
                record.add_requested_service(service_id, idp_id, id_token, false);
                if let Err(e) = self.registry.submit(Table::Requested, key, record) {
                    error!(gateway = %addr.ip, error = %e, "failed to store new tunnel record");
                    return;
                }
                self.start_connect(&addr.ip);
            }
            Some(ConnState::Connected) => {
                info!(service_id, gateway = %addr.ip, "tunnel already open, requesting service now");
                if let Some(record) = self.registry.find_mut(Table::Requested, &key) {
                    if !record.add_requested_service(service_id, idp_id, id_token, false) {
                        debug!(service_id, "service already queued on tunnel");
                    }
                }
                self.flush_service_requests(&addr.ip).await;
            }
            Some(_) => {
                info!(service_id, gateway = %addr.ip, "tunnel request pending, queueing service");
                if let Some(record) = self.registry.find_mut(Table::Requested, &key) {
                    if !record.add_requested_service(service_id, idp_id, id_token, false) {
                        debug!(service_id, "service already queued on tunnel");
                    }
                }
            }
        }
    }

    /// Record a gateway's grant or denial of a service against the
    /// owning tunnel record. Bookkeeping only; nothing goes out on the
    /// wire in response.
    fn mark_service_outcome(&mut self, service_id: u32, granted: bool) {
        let addr = match self.resolver.resolve(service_id) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(service_id, error = %e, "service outcome for an unresolvable service, no action taken");
                return;
            }
        };
        let key = TableKey::GatewayIp(addr.ip);
        let Some(record) = self.registry.find_mut(Table::Requested, &key) else {
            debug!(service_id, "service outcome for an unknown tunnel, no action taken");
            return;
        };

        if granted {
            if record.mark_service_opened(service_id) {
                info!(service_id, gateway = %record.gateway_ip, "service granted");
            } else {
                debug!(service_id, "grant for a service that was never requested");
            }
        } else if record.mark_service_rejected(service_id) {
            info!(service_id, gateway = %record.gateway_ip, "service denied");
        } else {
            debug!(service_id, "denial for a service that was never requested");
        }
    }

    /// Disconnected -> Connecting. The actual TCP connect runs in a
    /// spawned task; its outcome comes back as a command keyed by
    /// gateway IP.
    fn start_connect(&mut self, gateway_ip: &str) {
        let key = TableKey::GatewayIp(gateway_ip.to_string());
        let Some(record) = self.registry.find_mut(Table::Requested, &key) else {
            error!(gateway = %gateway_ip, "connect requested for a tunnel that no longer exists");
            return;
        };

        record.state = ConnState::Connecting;
        record.attempts += 1;
        record.next_retry_at = None;
        let attempt = record.attempts;
        let port = record.gateway_port;
        let target = record.gateway_ip.clone();
        info!(gateway = %target, port, attempt, "connecting tunnel");

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect((target.as_str(), port)).await;
            let _ = tx
                .send(Command::ConnectFinished {
                    gateway_ip: target,
                    result,
                })
                .await;
        });
    }

    /// Connecting -> Connected, or schedule a retry.
    async fn on_connect_finished(
        &mut self,
        gateway_ip: String,
        result: std::io::Result<TcpStream>,
    ) {
        match result {
            Ok(stream) => {
                let key = TableKey::GatewayIp(gateway_ip.clone());
                let Some(record) = self.registry.find_mut(Table::Requested, &key) else {
                    // Torn down while the connect was in flight; the
                    // stream drops here and that is the whole cleanup.
                    warn!(gateway = %gateway_ip, "connect finished for a tunnel that no longer exists");
                    return;
                };
                record.state = ConnState::Connected;
                record.next_retry_at = None;
                record.transport = Some(stream);
                info!(gateway = %gateway_ip, "tunnel connected");

                self.flush_service_requests(&gateway_ip).await;
            }
            Err(e) => {
                error!(gateway = %gateway_ip, error = %e, "tunnel connection attempt failed");
                self.schedule_retry(&gateway_ip);
            }
        }
    }

    /// Connecting -> retry-scheduled, or terminal give-up once the
    /// attempt budget is spent.
    fn schedule_retry(&mut self, gateway_ip: &str) {
        let key = TableKey::GatewayIp(gateway_ip.to_string());
        let Some(record) = self.registry.find_mut(Table::Requested, &key) else {
            error!(gateway = %gateway_ip, "retry wanted for a tunnel that no longer exists, cannot retry connection");
            return;
        };

        record.state = ConnState::Disconnected;

        if record.attempts >= self.config.max_con_attempts {
            let err = SdpError::RetriesExhausted {
                gateway: gateway_ip.to_string(),
                attempts: record.attempts,
            };
            error!(error = %err, "giving up attempted tunnel connection");
            // Terminal: the record and any queued service requests are
            // dropped with no notification to the original requesters.
            self.registry.remove(Table::Requested, &key);
            return;
        }

        let delay = self.config.retry_delay_base * record.attempts;
        record.next_retry_at = Some(Instant::now() + delay);
        debug!(gateway = %gateway_ip, delay_ms = delay.as_millis() as u64, "scheduling connection retry");

        let tx = self.tx.clone();
        let gateway_ip = gateway_ip.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::RetryDue { gateway_ip }).await;
        });
    }

    /// A retry delay elapsed; reconnect if the record still exists.
    fn on_retry_due(&mut self, gateway_ip: String) {
        let key = TableKey::GatewayIp(gateway_ip.clone());
        if self.registry.find(Table::Requested, &key).is_none() {
            error!(gateway = %gateway_ip, "retry fired for a tunnel that no longer exists, cannot retry connection");
            return;
        }
        self.start_connect(&gateway_ip);
    }

    /// Send the service-request message for every queued entry, in
    /// request order, marking each sent exactly once.
    async fn flush_service_requests(&mut self, gateway_ip: &str) {
        let key = TableKey::GatewayIp(gateway_ip.to_string());
        let Some(record) = self.registry.find_mut(Table::Requested, &key) else {
            error!(gateway = %gateway_ip, "cannot flush service requests, tunnel record missing");
            return;
        };
        if record.state != ConnState::Connected {
            return;
        }

        let sdp_id = record.sdp_id;
        let pending: Vec<(u32, u32, String)> = record
            .services_requested
            .iter()
            .filter(|entry| !entry.request_sent)
            .map(|entry| (entry.service_id, entry.idp_id, entry.id_token.clone()))
            .collect();

        for (service_id, idp_id, id_token) in pending {
            let msg = match encode(
                Action::ServiceRequest,
                sdp_id,
                service_id,
                idp_id,
                Some(&id_token),
                None,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    error!(service_id, error = %e, "failed to create service request message");
                    continue;
                }
            };

            let Some(stream) = record.transport.as_mut() else {
                error!(gateway = %gateway_ip, "tunnel transport missing, cannot send service request");
                break;
            };
            if let Err(e) = stream.write_all(msg.as_bytes()).await {
                // Entry stays unsent for a later flush.
                error!(gateway = %gateway_ip, error = %e, "failed to send service request message");
                break;
            }

            if let Some(entry) = record
                .services_requested
                .iter_mut()
                .find(|entry| entry.service_id == service_id)
            {
                entry.request_sent = true;
            }
            info!(service_id, gateway = %gateway_ip, "service request sent");
        }
    }
}
