//! UDP broadcast discovery and targeted rediscovery.
//!
//! All discovery traffic flows through one shared listening socket per
//! [`DiscoveryManager`]. The socket is opened when the first listener
//! registers and closed when the last one unregisters; replies are
//! fanned out to every registered listener.

use crate::error::{BroadlinkError, Result};
use crate::protocol::{self, DiscoveryReply};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;

/// Collection window for an initial device scan.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Shorter window used when hunting for one specific missing device.
pub const REDISCOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Devices listen for the discovery broadcast on port 80.
const BROADCAST_PORT: u16 = 80;

const RECV_BUFFER_LENGTH: usize = 1024;
const LISTENER_QUEUE_DEPTH: usize = 64;

struct RegisteredListener {
    id: u64,
    tx: mpsc::Sender<DiscoveryReply>,
}

struct Shared {
    socket: Option<Arc<UdpSocket>>,
    local_port: u16,
    listeners: Vec<RegisteredListener>,
    next_id: u64,
    cancel: Option<CancellationToken>,
}

/// Owns the shared discovery listening socket and its listener registry.
///
/// Inject one manager per process and share it between devices; it is
/// never a global. Reference counting is by listener registration.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<Inner>,
}

struct Inner {
    broadcast_target: SocketAddr,
    shared: Mutex<Shared>,
}

/// A registration on the shared discovery socket. Dropping it
/// unregisters; when the last listener goes, the socket closes.
pub struct DiscoveryListener {
    id: u64,
    rx: mpsc::Receiver<DiscoveryReply>,
    manager: DiscoveryManager,
}

impl DiscoveryListener {
    /// Receive the next parsed discovery reply.
    pub async fn recv(&mut self) -> Option<DiscoveryReply> {
        self.rx.recv().await
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryManager {
    pub fn new() -> Self {
        Self::with_target(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            BROADCAST_PORT,
        ))
    }

    /// Aim discovery broadcasts somewhere other than the subnet
    /// broadcast address. Mostly useful for tests.
    pub fn with_target(broadcast_target: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                broadcast_target,
                shared: Mutex::new(Shared {
                    socket: None,
                    local_port: 0,
                    listeners: Vec::new(),
                    next_id: 0,
                    cancel: None,
                }),
            }),
        }
    }

    /// Register a listener, opening the shared socket if this is the
    /// first registration.
    pub fn register(&self) -> Result<DiscoveryListener> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        let mut shared = self.inner.shared.lock();

        if shared.socket.is_none() {
            let socket = create_listen_socket()?;
            shared.local_port = socket.local_addr()?.port();
            let cancel = CancellationToken::new();
            spawn_receiver(self.clone(), socket.clone(), cancel.clone());
            shared.socket = Some(socket);
            shared.cancel = Some(cancel);
        }

        let id = shared.next_id;
        shared.next_id += 1;
        shared.listeners.push(RegisteredListener { id, tx });
        Ok(DiscoveryListener {
            id,
            rx,
            manager: self.clone(),
        })
    }

    fn unregister(&self, id: u64) {
        let mut shared = self.inner.shared.lock();
        shared.listeners.retain(|l| l.id != id);
        if shared.listeners.is_empty() {
            if let Some(cancel) = shared.cancel.take() {
                cancel.cancel();
            }
            if shared.socket.take().is_some() {
                info!("Discovery socket closed");
            }
        }
    }

    fn shared_socket(&self) -> Result<(Arc<UdpSocket>, u16)> {
        let shared = self.inner.shared.lock();
        match (shared.socket.as_ref(), shared.local_port) {
            (Some(socket), port) => Ok((socket.clone(), port)),
            _ => Err(BroadlinkError::Io("discovery socket not open".into())),
        }
    }

    /// Broadcast one discovery packet from the shared socket. The packet
    /// advertises the socket's own bound port so replies land on it.
    pub async fn send_discovery(&self) -> Result<()> {
        let (socket, local_port) = self.shared_socket()?;
        let local_ip = local_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let packet = protocol::build_discovery_packet(local_ip, local_port);
        debug!(
            "Sending discovery broadcast to {} (local {}:{})",
            self.inner.broadcast_target, local_ip, local_port
        );
        socket
            .send_to(&packet, self.inner.broadcast_target)
            .await?;
        Ok(())
    }

    /// Scan the local subnet for devices, collecting replies for the
    /// given window. Results are deduplicated by MAC.
    pub async fn scan(&self, window: Duration) -> Result<Vec<DiscoveryReply>> {
        info!(
            "Beginning Broadlink device scan; will wait {:?} for responses",
            window
        );
        let mut listener = self.register()?;
        self.send_discovery().await?;

        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, listener.recv()).await {
                Ok(Some(reply)) => {
                    if seen.insert(reply.mac) {
                        debug!(
                            "Discovered device {} (model {:#06x}) at {}:{}",
                            protocol::format_mac(&reply.mac),
                            reply.model,
                            reply.addr,
                            reply.port
                        );
                        found.push(reply);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        info!("Ended Broadlink device scan; found {} devices", found.len());
        Ok(found)
    }

    /// Hunt for one specific device by its configured MAC. A one-shot
    /// agent: the first matching reply wins; a window with no match is a
    /// [`BroadlinkError::DiscoveryTimeout`]. Whether to try again is the
    /// caller's decision.
    pub async fn rediscover(&self, mac: &[u8; 6], window: Duration) -> Result<IpAddr> {
        info!(
            "Beginning device scan for missing device {}",
            protocol::format_mac_configured(mac)
        );
        let mut listener = self.register()?;
        self.send_discovery().await?;

        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, listener.recv()).await {
                Ok(Some(reply)) => {
                    trace!(
                        "Reply during rediscovery: from {}:{} [{}]",
                        reply.addr,
                        reply.port,
                        protocol::format_mac(&reply.mac)
                    );
                    // Reply MACs are in reverse order relative to the
                    // configured wire order.
                    if reply.mac.iter().rev().eq(mac.iter()) {
                        info!(
                            "Match for target MAC {} at {} - reassociate",
                            protocol::format_mac(&reply.mac),
                            reply.addr
                        );
                        return Ok(reply.addr);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        warn!(
            "No rediscovery match for {} within {:?}",
            protocol::format_mac_configured(mac),
            window
        );
        Err(BroadlinkError::DiscoveryTimeout)
    }
}

fn spawn_receiver(manager: DiscoveryManager, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_LENGTH];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, from)) => {
                            if let Some(reply) =
                                protocol::parse_discovery_response(&buf[..len], from.ip(), from.port())
                            {
                                let shared = manager.inner.shared.lock();
                                for listener in &shared.listeners {
                                    let _ = listener.tx.try_send(reply.clone());
                                }
                            }
                        }
                        Err(e) => {
                            error!("Error while receiving discovery reply: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        debug!("Discovery receiver task ended");
    });
}

fn create_listen_socket() -> Result<Arc<UdpSocket>> {
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(bind_addr))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(Arc::new(UdpSocket::from_std(std_socket)?))
}

/// Best-effort local site address: route towards a public host and read
/// the chosen source address. No traffic is sent.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
