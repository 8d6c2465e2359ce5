//! The Unix socket control channel. A client connects, sends one JSON
//! frame (`{"action": "add"|"del", "ip": "a.b.c.d"}`), and the connection
//! is closed; no response payload is sent. Malformed frames are logged
//! and otherwise ignored, since a garbled client must never take the
//! daemon down.

use crate::counter_store::CounterStore;
use anyhow::Result;
use netacct_proto::ControlRequest;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

const MAX_FRAME_BYTES: usize = 512;

/// Bind the control socket, deleting any stale socket file first. Bind
/// failure is a fatal startup error, so this runs in `main` before any
/// worker is spawned.
pub fn bind_socket(path: &str) -> Result<std::os::unix::net::UnixListener> {
    let socket_path = Path::new(path);
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = std::os::unix::net::UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;
    info!("Control channel listening on {path}");
    Ok(listener)
}

/// Run the control server on its own thread, inside a current-thread
/// tokio runtime, until the shutdown channel fires.
pub fn spawn_control_server(
    listener: std::os::unix::net::UnixListener,
    store: Arc<CounterStore>,
    stop_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("Control Channel".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            match runtime {
                Ok(runtime) => runtime.block_on(listen(listener, store, stop_rx)),
                Err(e) => warn!("Unable to build control runtime: {:?}", e),
            }
        })?;
    Ok(handle)
}

async fn listen(
    listener: std::os::unix::net::UnixListener,
    store: Arc<CounterStore>,
    mut stop_rx: tokio::sync::watch::Receiver<bool>,
) {
    let listener = match UnixListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Unable to adopt control socket: {:?}", e);
            return;
        }
    };
    loop {
        tokio::select!(
            _ = stop_rx.changed() => {
                break;
            }
            ret = listener.accept() => {
                match ret {
                    Ok((mut socket, _)) => handle_client(&mut socket, &store).await,
                    Err(e) => warn!("Control accept failed: {:?}", e),
                }
            }
        );
    }
    info!("Control channel stopped");
}

async fn handle_client(socket: &mut UnixStream, store: &CounterStore) {
    let mut buf = vec![0u8; MAX_FRAME_BYTES];
    match socket.read(&mut buf).await {
        Ok(0) => {}
        Ok(n) => handle_frame(&buf[..n], store),
        Err(e) => warn!("Control read failed: {:?}", e),
    }
    // Connection closes on drop; no response payload is defined.
}

/// Decode and apply one control frame.
pub(crate) fn handle_frame(frame: &[u8], store: &CounterStore) {
    let request: ControlRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Discarding malformed control frame: {:?}", e);
            return;
        }
    };
    let ip: Ipv4Addr = match request.ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            warn!("Control frame carries an unparsable IPv4 address: {}", request.ip);
            return;
        }
    };
    match request.action.as_str() {
        "add" => match store.register(ip) {
            Ok(()) => info!("Tracking {ip}"),
            Err(e) => warn!("Unable to track {ip}: {e}"),
        },
        "del" => match store.deregister(ip) {
            Some(finals) => info!(
                "Stopped tracking {ip} (final rx={} tx={})",
                finals.rx_bytes, finals.tx_bytes
            ),
            None => warn!("Asked to stop tracking {ip}, which was not tracked"),
        },
        other => warn!("Unknown control action: {other}"),
    }
}
