//! End-to-end flow: a service request written to the IPC pipe drives a
//! tunnel connection to the gateway and a service-request message over
//! the new tunnel.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

use sdpc_manager::ipc::{pipe_path, IpcServer, PipeRole};
use sdpc_manager::{LogTrafficHandler, ManagerConfig, StanzaResolver, TunnelManager};
use sdpc_proto::{codec, Action};

#[tokio::test]
async fn pipe_request_opens_tunnel_and_sends_service_requests() {
    // fake gateway
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_port = gateway.local_addr().unwrap().port();

    let stanzas = format!(
        "[default]\ngateway = \"127.0.0.1\"\nport = {gateway_port}\n\n[7]\n\n[9]\n"
    );
    let resolver = StanzaResolver::parse(&stanzas).unwrap();

    let config = ManagerConfig {
        sdp_id: 1,
        ..ManagerConfig::default()
    };
    let (manager, handle) = TunnelManager::new(
        config,
        Arc::new(resolver),
        Arc::new(LogTrafficHandler),
    );
    let manager_task = tokio::spawn(manager.run());

    let dir = tempfile::tempdir().unwrap();
    let server = IpcServer::bind(dir.path(), PipeRole::Client, handle.clone()).unwrap();
    let socket_path = pipe_path(dir.path(), PipeRole::Client);
    let ipc_task = tokio::spawn(server.run());

    let send_request = |service_id: u32, token: &str| {
        let request =
            codec::encode(Action::ServiceRequest, 1, service_id, 1, Some(token), None).unwrap();
        let path = socket_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut pipe = UnixStream::connect(&path).unwrap();
            pipe.write_all(request.as_bytes()).unwrap();
        })
    };

    // first ask opens the tunnel
    send_request(7, "tok-A").await.unwrap();
    let (mut tunnel, _) = timeout(Duration::from_secs(5), gateway.accept())
        .await
        .unwrap()
        .unwrap();

    // second ask for the same gateway rides the existing record
    send_request(9, "tok-B").await.unwrap();

    let mut received = String::new();
    let mut buf = vec![0u8; 4096];
    while !(received.contains("\"service_id\":7") && received.contains("\"service_id\":9")) {
        let n = timeout(Duration::from_secs(5), tunnel.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "tunnel closed before both requests arrived");
        received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
    }
    let first = received.find("\"service_id\":7").unwrap();
    let second = received.find("\"service_id\":9").unwrap();
    assert!(first < second, "requests out of order: {received}");

    // no second tunnel was opened for the shared gateway
    assert!(
        timeout(Duration::from_millis(200), gateway.accept())
            .await
            .is_err(),
        "a second tunnel connection was opened"
    );

    handle.shutdown().await;
    ipc_task.abort();
    manager_task.await.unwrap();
}
