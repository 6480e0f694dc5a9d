//! Local IPC: the manager's Unix-socket request pipe.
//!
//! The server side runs next to the manager task; each accepted
//! connection delivers JSON control messages which are dispatched into
//! the manager. Nothing is written back on this path; the pipe is
//! one-shot per message.
//!
//! The client side ([`ask_for_service`]) is the synchronous call other
//! local processes use to ask a running manager for a service. It
//! blocks, with a bounded read timeout, and must be run off the event
//! loop.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use sdpc_proto::{
    codec, Action, SdpError, SdpResult, ID_TOKEN_MAX_LEN, MAX_PIPE_MSG_LEN,
};

use crate::manager::ManagerHandle;

/// Read timeout for the blocking client call.
pub const ASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Well-known socket names under the runtime directory, one per
/// manager role.
pub const CLIENT_PIPE_NAME: &str = "tm_client.sock";
pub const GATEWAY_PIPE_NAME: &str = "tm_gateway.sock";

/// Which manager role a pipe belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Client,
    Gateway,
}

/// The well-known pipe path for a role, under `dir`.
pub fn pipe_path(dir: &Path, role: PipeRole) -> PathBuf {
    match role {
        PipeRole::Client => dir.join(CLIENT_PIPE_NAME),
        PipeRole::Gateway => dir.join(GATEWAY_PIPE_NAME),
    }
}

/// Default runtime directory for the pipes.
pub fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sdpc")
}

/// IPC server: accepts short-lived local connections and feeds decoded
/// messages to the manager.
pub struct IpcServer {
    listener: UnixListener,
    handle: ManagerHandle,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the role-specific pipe, replacing any stale socket file.
    pub fn bind(dir: &Path, role: PipeRole, handle: ManagerHandle) -> SdpResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = pipe_path(dir, role);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "IPC pipe listening");
        Ok(Self {
            listener,
            handle,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Runs until the listener fails or the task is
    /// cancelled at shutdown.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handle).await {
                            warn!(error = %e, "pipe connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "pipe accept failed");
                    break;
                }
            }
        }
    }
}

/// Buffer pipe input until a complete JSON message is decodable, then
/// dispatch it. Input past `MAX_PIPE_MSG_LEN` is an error, not a silent
/// truncation.
async fn serve_connection(
    mut stream: tokio::net::UnixStream,
    handle: ManagerHandle,
) -> SdpResult<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > MAX_PIPE_MSG_LEN {
            return Err(SdpError::message_too_large());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Ok(text) = std::str::from_utf8(&buf) {
            if let Ok(msg) = codec::decode(text) {
                info!(action = %msg.action, "pipe message received");
                handle.dispatch(msg).await?;
                buf.clear();
            }
        }
    }

    if !buf.is_empty() {
        // peer closed mid-buffer; whatever is left must be one message
        let text = std::str::from_utf8(&buf)
            .map_err(|e| SdpError::MalformedMessage(e.to_string()))?;
        let msg = codec::decode(text)?;
        info!(action = %msg.action, "pipe message received");
        handle.dispatch(msg).await?;
    }

    Ok(())
}

/// Pick the first parseable non-zero service id from a comma-separated
/// list, trimming whitespace around each token.
pub fn first_service_id(list: &str) -> Option<u32> {
    list.split(',').find_map(|token| match token.trim().parse::<u32>() {
        Ok(id) if id != 0 => Some(id),
        _ => None,
    })
}

/// Ask a running manager for access to a service.
///
/// Blocking, with a 60-second read timeout; run off the event loop.
/// Succeeds only on an explicit `service_granted` reply. Every other
/// outcome — bad arguments, socket failure, timeout, a peer that closes
/// without answering, a non-granted reply — fails with its own log
/// line, and there is no retry at this layer.
pub fn ask_for_service(
    socket_path: &Path,
    sdp_id: u32,
    service_ids_str: &str,
    idp_id: u32,
    id_token: &str,
) -> SdpResult<()> {
    if sdp_id == 0 || idp_id == 0 || service_ids_str.is_empty() || id_token.is_empty() {
        error!("ask_for_service() invalid arg provided");
        return Err(SdpError::InvalidArgument(
            "sdp id, service list, idp id and id token are all required".into(),
        ));
    }
    if id_token.len() >= ID_TOKEN_MAX_LEN {
        error!(limit = ID_TOKEN_MAX_LEN, "ask_for_service() id token too long");
        return Err(SdpError::InvalidArgument("id token too long".into()));
    }
    let Some(service_id) = first_service_id(service_ids_str) else {
        error!(list = %service_ids_str, "ask_for_service() found no usable service id");
        return Err(SdpError::InvalidArgument(format!(
            "no usable service id in {service_ids_str:?}"
        )));
    };

    let request = codec::encode(
        Action::ServiceRequest,
        sdp_id,
        service_id,
        idp_id,
        Some(id_token),
        None,
    )?;

    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        error!(path = %socket_path.display(), error = %e, "cannot connect to tunnel manager pipe");
        SdpError::Transport(format!("pipe connect failed: {e}"))
    })?;
    stream.set_read_timeout(Some(ASK_TIMEOUT))?;
    info!("connected to tunnel manager's pipe");

    stream.write_all(request.as_bytes()).map_err(|e| {
        error!(error = %e, "pipe send failed");
        SdpError::Transport(format!("pipe send failed: {e}"))
    })?;

    let mut buf = vec![0u8; MAX_PIPE_MSG_LEN];
    let n = stream.read(&mut buf).map_err(|e| {
        error!(error = %e, "pipe recv failed");
        SdpError::Transport(format!("pipe recv failed: {e}"))
    })?;

    if n == 0 {
        error!("tunnel manager closed pipe connection without answer");
        return Err(SdpError::Transport(
            "closed pipe connection without answer".into(),
        ));
    }

    let text = std::str::from_utf8(&buf[..n])
        .map_err(|e| SdpError::MalformedMessage(e.to_string()))?;
    debug!(reply = %text, "message received from tunnel manager");

    let reply = codec::decode(text)?;
    if reply.action == Action::ServiceGranted {
        info!("service request granted");
        Ok(())
    } else {
        error!(action = %reply.action, "service request failed");
        Err(SdpError::Transport("service request was not granted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogTrafficHandler, ManagerConfig, StanzaResolver, TunnelManager};
    use std::os::unix::net::UnixListener as StdUnixListener;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn oversize_pipe_input_is_rejected() {
        let resolver = StanzaResolver::parse("").unwrap();
        let (_manager, handle) = TunnelManager::new(
            ManagerConfig::default(),
            Arc::new(resolver),
            Arc::new(LogTrafficHandler),
        );
        let (mut sender, receiver) = tokio::net::UnixStream::pair().unwrap();
        let serve = tokio::spawn(serve_connection(receiver, handle));

        let writer = tokio::spawn(async move {
            let payload = vec![b'x'; MAX_PIPE_MSG_LEN + 1];
            // the peer may error out and close mid-stream
            let _ = sender.write_all(&payload).await;
            let _ = sender.shutdown().await;
        });

        let err = serve.await.unwrap().unwrap_err();
        assert!(matches!(err, SdpError::MessageTooLarge { .. }));
        writer.await.unwrap();
    }

    #[test]
    fn first_service_id_takes_first_usable_token() {
        assert_eq!(first_service_id("9, 9, abc"), Some(9));
        assert_eq!(first_service_id("abc, 0, 12"), Some(12));
        assert_eq!(first_service_id(" 7 "), Some(7));
        assert_eq!(first_service_id("abc"), None);
        assert_eq!(first_service_id("0"), None);
        assert_eq!(first_service_id(""), None);
    }

    #[test]
    fn ask_rejects_bad_arguments() {
        let path = Path::new("/nonexistent.sock");
        assert!(matches!(
            ask_for_service(path, 0, "7", 1, "tok"),
            Err(SdpError::InvalidArgument(_))
        ));
        assert!(matches!(
            ask_for_service(path, 1, "abc", 1, "tok"),
            Err(SdpError::InvalidArgument(_))
        ));
        let oversized = "x".repeat(ID_TOKEN_MAX_LEN);
        assert!(matches!(
            ask_for_service(path, 1, "7", 1, &oversized),
            Err(SdpError::InvalidArgument(_))
        ));
    }

    /// Run a one-connection fake manager that answers with `reply`
    /// (or closes silently when `reply` is None).
    fn fake_manager(
        dir: &Path,
        reply: Option<String>,
    ) -> (PathBuf, std::thread::JoinHandle<String>) {
        let path = dir.join("fake.sock");
        let listener = StdUnixListener::bind(&path).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = conn.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            if let Some(reply) = reply {
                conn.write_all(reply.as_bytes()).unwrap();
            }
            request
        });
        (path, handle)
    }

    #[test]
    fn ask_succeeds_on_granted_reply() {
        let dir = tempfile::tempdir().unwrap();
        let granted = codec::encode(Action::ServiceGranted, 1, 7, 1, None, None).unwrap();
        let (path, server) = fake_manager(dir.path(), Some(granted));

        ask_for_service(&path, 1, "7,9", 1, "tok-A").unwrap();

        let request = server.join().unwrap();
        let msg = codec::decode(&request).unwrap();
        assert_eq!(msg.action, Action::ServiceRequest);
        assert_eq!(msg.service_id, Some(7));
        assert_eq!(msg.sdp_id, Some(1));
        assert_eq!(msg.id_token.as_deref(), Some("tok-A"));
    }

    #[test]
    fn ask_fails_on_denied_reply() {
        let dir = tempfile::tempdir().unwrap();
        let denied = codec::encode(Action::ServiceDenied, 1, 7, 1, None, None).unwrap();
        let (path, server) = fake_manager(dir.path(), Some(denied));

        let err = ask_for_service(&path, 1, "7", 1, "tok-A").unwrap_err();
        assert!(matches!(err, SdpError::Transport(_)));
        server.join().unwrap();
    }

    #[test]
    fn ask_fails_on_silent_close() {
        let dir = tempfile::tempdir().unwrap();
        let (path, server) = fake_manager(dir.path(), None);

        let err = ask_for_service(&path, 1, "7", 1, "tok-A").unwrap_err();
        assert!(matches!(err, SdpError::Transport(_)));
        server.join().unwrap();
    }

    #[test]
    fn ask_fails_when_pipe_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let err = ask_for_service(&path, 1, "7", 1, "tok-A").unwrap_err();
        assert!(matches!(err, SdpError::Transport(_)));
    }
}
