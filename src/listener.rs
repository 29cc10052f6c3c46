//! Listener pool
//!
//! Binds one UDP and/or TCP socket per distinct port in the source
//! snapshot and demultiplexes inbound records to sources by peer IP.
//! Unauthorized peers are dropped with a warning. A bind or accept failure
//! is fatal only to that listener; the rest of the pool keeps running.

use crate::processor::ProcessorPool;
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};
use crate::sources::{Protocol, Source};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Maximum UDP datagram size accepted
const MAX_DATAGRAM: usize = 65_535;
/// Idle time after which a TCP connection is closed
const TCP_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-port admission maps: authorized peer IP to source ID, per protocol.
#[derive(Debug, Default, Clone)]
pub struct PortIndex {
    pub udp: HashMap<Ipv4Addr, String>,
    pub tcp: HashMap<Ipv4Addr, String>,
}

/// Group a source snapshot by port, building O(1) peer-IP admission maps.
pub fn build_port_index(sources: &HashMap<String, Source>) -> HashMap<u16, PortIndex> {
    let mut index: HashMap<u16, PortIndex> = HashMap::new();
    for (id, source) in sources {
        let entry = index.entry(source.port).or_default();
        let map = match source.protocol {
            Protocol::Udp => &mut entry.udp,
            Protocol::Tcp => &mut entry.tcp,
        };
        map.insert(source.peer_ip, id.clone());
    }
    index
}

/// Owns the listener tasks for one configuration epoch.
pub struct ListenerPool {
    shutdown: ShutdownHandle,
    listeners: Vec<JoinHandle<()>>,
}

impl ListenerPool {
    /// Spawn listeners for every port in the snapshot.
    pub fn start(sources: Arc<HashMap<String, Source>>, pool: Arc<ProcessorPool>) -> Self {
        let (shutdown, _) = shutdown::channel();
        let index = build_port_index(&sources);

        let mut listeners = Vec::new();
        for (port, port_index) in index {
            if !port_index.udp.is_empty() {
                listeners.push(tokio::spawn(run_udp_listener(
                    port,
                    port_index.udp,
                    pool.clone(),
                    shutdown.subscribe(),
                )));
            }
            if !port_index.tcp.is_empty() {
                listeners.push(tokio::spawn(run_tcp_listener(
                    port,
                    port_index.tcp,
                    pool.clone(),
                    shutdown.subscribe(),
                )));
            }
        }

        info!("Started {} listener(s)", listeners.len());
        Self {
            shutdown,
            listeners,
        }
    }

    /// Stop every listener and wait for their sockets to close.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        for listener in self.listeners {
            let _ = listener.await;
        }
        info!("All listeners stopped");
    }
}

async fn run_udp_listener(
    port: u16,
    ip_map: HashMap<Ipv4Addr, String>,
    pool: Arc<ProcessorPool>,
    mut signal: ShutdownSignal,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to start UDP listener on port {port}: {e}");
            return;
        }
    };
    info!("UDP listener started on port {port}");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = signal.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) => {
                    let IpAddr::V4(peer) = addr.ip() else { continue };
                    match ip_map.get(&peer) {
                        Some(source_id) => pool.enqueue(source_id, decode(&buf[..len])),
                        None => warn!("Received UDP record from unauthorized IP: {peer}"),
                    }
                }
                Err(e) => error!("Error in UDP listener on port {port}: {e}"),
            }
        }
    }
}

async fn run_tcp_listener(
    port: u16,
    ip_map: HashMap<Ipv4Addr, String>,
    pool: Arc<ProcessorPool>,
    mut signal: ShutdownSignal,
) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start TCP listener on port {port}: {e}");
            return;
        }
    };
    info!("TCP listener started on port {port}");

    loop {
        tokio::select! {
            _ = signal.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let IpAddr::V4(peer) = addr.ip() else { continue };
                    match ip_map.get(&peer) {
                        Some(source_id) => {
                            // Connection handlers observe the same stop signal
                            tokio::spawn(handle_tcp_client(
                                stream,
                                source_id.clone(),
                                pool.clone(),
                                signal.clone(),
                            ));
                        }
                        None => {
                            warn!("TCP connection from unauthorized IP: {peer}");
                            drop(stream);
                        }
                    }
                }
                Err(e) => error!("Error accepting TCP connection on port {port}: {e}"),
            }
        }
    }
}

/// Per-connection handler: split the byte stream on newlines and forward
/// each non-empty segment. Any trailing partial segment is flushed when
/// the connection ends.
async fn handle_tcp_client(
    mut stream: TcpStream,
    source_id: String,
    pool: Arc<ProcessorPool>,
    mut signal: ShutdownSignal,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            _ = signal.recv() => break,
            read = tokio::time::timeout(TCP_INACTIVITY_TIMEOUT, stream.read(&mut chunk)) => {
                match read {
                    // Inactive connection
                    Err(_) => break,
                    // Closed by the client
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).take(pos).collect();
                            if !line.is_empty() {
                                pool.enqueue(&source_id, decode(&line));
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Error receiving TCP data: {e}");
                        break;
                    }
                }
            }
        }
    }

    if !buffer.is_empty() {
        pool.enqueue(&source_id, decode(&buffer));
    }
}

/// Decode inbound bytes: UTF-8 when valid, 8-bit passthrough otherwise so
/// no byte sequence is ever rejected.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
