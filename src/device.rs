//! Device lifecycle: configuration, connectivity tracking, polling and
//! the forced-offline / rediscovery path for devices on dynamic IPs.

use crate::discovery::{DiscoveryManager, REDISCOVERY_WINDOW};
use crate::error::{BroadlinkError, Result};
use crate::protocol::{self, DEFAULT_AUTH_KEY, DEFAULT_IV};
use crate::session::DeviceSession;
use crate::transport::RetryableSocket;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// How long a reachability probe waits before declaring the host gone.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_DEVICE_PORT: u16 = 80;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 1;
const EVENT_QUEUE_DEPTH: usize = 16;

/// Static configuration for one device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// MAC in configured (wire) byte order, as printed on the device.
    pub mac: [u8; 6],
    /// Whether the IP is fixed. Dynamic-IP devices are rediscovered by
    /// MAC when they stop answering.
    pub static_ip: bool,
    pub poll_interval: Duration,
    /// Extra send attempts per exchange; anything above zero means one.
    pub retries: u32,
    pub recv_timeout: Duration,
    pub auth_key: [u8; 16],
    pub iv: [u8; 16],
}

impl DeviceConfig {
    /// Configuration with library defaults: port 80, static IP, 30s
    /// polling, one retry, the factory authorization key and IV.
    pub fn new(ip: &str, mac: &str) -> Result<Self> {
        let ip = ip
            .parse()
            .map_err(|_| BroadlinkError::ConfigError(format!("bad IP address '{}'", ip)))?;
        Ok(Self {
            ip,
            port: DEFAULT_DEVICE_PORT,
            mac: protocol::parse_mac(mac)?,
            static_ip: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retries: DEFAULT_RETRIES,
            recv_timeout: crate::transport::DEFAULT_RECV_TIMEOUT,
            auth_key: DEFAULT_AUTH_KEY,
            iv: DEFAULT_IV,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_static_ip(mut self, static_ip: bool) -> Self {
        self.static_ip = static_ip;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    /// Override the factory authorization key, hex encoded.
    pub fn with_auth_key(mut self, key: &str) -> Result<Self> {
        self.auth_key = parse_hex16(key)?;
        Ok(self)
    }

    /// Override the protocol IV, hex encoded.
    pub fn with_iv(mut self, iv: &str) -> Result<Self> {
        self.iv = parse_hex16(iv)?;
        Ok(self)
    }

    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

fn parse_hex16(s: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 16 {
        return Err(BroadlinkError::ConfigError(format!(
            "expected 16 hex bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Connectivity of a device as last evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Offline,
    Online,
}

/// Emitted whenever connectivity is (re)established or lost.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub status: DeviceStatus,
    pub reason: Option<String>,
}

/// Family-specific behaviour layered over a [`DeviceSession`].
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Read the device's current state. An error here forces the device
    /// offline.
    async fn get_status(&self, session: &DeviceSession) -> Result<()>;

    /// Called once after each successful handshake, before the first
    /// status read. Families with setup commands override this.
    async fn on_reachable(&self, _session: &DeviceSession) -> Result<()> {
        Ok(())
    }
}

/// Host reachability probe, separated out so connectivity handling can
/// be exercised without a live device.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self, addr: SocketAddr) -> bool;
}

/// Default probe: attempt a TCP connection to the device's address.
/// A refused connection still proves the host is up; only silence or
/// an unreachable network counts as gone.
pub struct TcpProbe;

#[async_trait]
impl Reachability for TcpProbe {
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        match timeout(REACHABILITY_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }
}

struct DeviceInner {
    config: RwLock<DeviceConfig>,
    session: DeviceSession,
    handler: Box<dyn DeviceHandler>,
    reachability: Box<dyn Reachability>,
    discovery: DiscoveryManager,
    status: RwLock<DeviceStatus>,
    events: broadcast::Sender<StatusEvent>,
    rediscovering: AtomicBool,
    cancel: CancellationToken,
}

/// One managed device: session, connectivity state and poll loop.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        handler: Box<dyn DeviceHandler>,
        discovery: DiscoveryManager,
    ) -> Result<Self> {
        Self::with_reachability(config, handler, discovery, Box::new(TcpProbe))
    }

    /// Full constructor with an injected reachability probe.
    pub fn with_reachability(
        config: DeviceConfig,
        handler: Box<dyn DeviceHandler>,
        discovery: DiscoveryManager,
        reachability: Box<dyn Reachability>,
    ) -> Result<Self> {
        let transport = RetryableSocket::new(config.target(), config.retries)
            .with_timeout(config.recv_timeout);
        let session = DeviceSession::new(config.mac, &config.auth_key, &config.iv, transport)?;
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        Ok(Self {
            inner: Arc::new(DeviceInner {
                config: RwLock::new(config),
                session,
                handler,
                reachability,
                discovery,
                status: RwLock::new(DeviceStatus::Offline),
                events,
                rediscovering: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn status(&self) -> DeviceStatus {
        *self.inner.status.read()
    }

    pub fn config(&self) -> DeviceConfig {
        self.inner.config.read().clone()
    }

    /// The underlying session, for driving family handlers directly
    /// (sending remote codes, switching sockets).
    pub fn session(&self) -> &DeviceSession {
        &self.inner.session
    }

    /// Stream of connectivity transitions.
    pub fn events(&self) -> impl futures_core::Stream<Item = StatusEvent> {
        let mut rx = self.inner.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Evaluate connectivity once: probe, handshake if needed, read
    /// status, and transition Online/Offline accordingly. The poll loop
    /// calls this every tick; callers may also invoke it directly.
    pub async fn refresh(&self) {
        let target = self.inner.session.target();
        if self.inner.reachability.is_reachable(target).await {
            self.handle_reachable().await;
        } else if self.inner.config.read().static_ip {
            self.force_offline(&format!("could not find device at IP {}", target.ip()));
        } else {
            self.spawn_rediscovery();
        }
    }

    async fn handle_reachable(&self) {
        if !self.inner.session.is_authenticated() {
            if !self.inner.session.authenticate().await {
                self.force_offline("configuration error");
                return;
            }
            if let Err(e) = self.inner.handler.on_reachable(&self.inner.session).await {
                warn!("Post-handshake setup failed: {}", e);
                self.force_offline("communication error");
                return;
            }
        }

        match self.inner.handler.get_status(&self.inner.session).await {
            Ok(()) => self.set_online(),
            Err(e) => {
                error!("Status read failed: {}", e);
                self.force_offline("communication error");
            }
        }
    }

    /// Hunt for a dynamic-IP device that stopped answering. The hunt
    /// runs on its own task so the poll tick returns immediately; state
    /// changes arrive only from the hunt's outcome. At most one hunt
    /// runs at a time; overlapping ticks skip theirs.
    fn spawn_rediscovery(&self) {
        if self
            .inner
            .rediscovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rediscovery already in progress; skipping this tick");
            return;
        }

        let device = self.clone();
        tokio::spawn(async move {
            let mac = device.inner.config.read().mac;
            let result = device
                .inner
                .discovery
                .rediscover(&mac, REDISCOVERY_WINDOW)
                .await;

            match result {
                Ok(addr) => {
                    let target = {
                        let mut config = device.inner.config.write();
                        config.ip = addr;
                        config.target()
                    };
                    info!(
                        "Rediscovered device {} at {}",
                        protocol::format_mac_configured(&mac),
                        target
                    );
                    device.inner.session.set_target(target);
                    device.handle_reachable().await;
                }
                Err(_) => device.force_offline("couldn't rediscover device"),
            }
            device.inner.rediscovering.store(false, Ordering::SeqCst);
        });
    }

    fn set_online(&self) {
        let mut status = self.inner.status.write();
        if *status != DeviceStatus::Online {
            *status = DeviceStatus::Online;
            info!("Device {} is back online", self.inner.session.target());
            let _ = self.inner.events.send(StatusEvent {
                status: DeviceStatus::Online,
                reason: None,
            });
        }
    }

    /// Drop the device to Offline: forget session credentials, tear down
    /// the transport socket, and report why.
    pub fn force_offline(&self, reason: &str) {
        warn!("Device {} is offline: {}", self.inner.session.target(), reason);
        self.inner.session.clear();
        self.inner.session.close();
        *self.inner.status.write() = DeviceStatus::Offline;
        let _ = self.inner.events.send(StatusEvent {
            status: DeviceStatus::Offline,
            reason: Some(reason.to_string()),
        });
    }

    /// Begin polling at the configured interval. The first evaluation
    /// happens immediately; the interval is a fixed delay between the
    /// end of one evaluation and the start of the next.
    pub fn start(&self) {
        let device = self.clone();
        let cancel = self.inner.cancel.clone();
        let interval = self.inner.config.read().poll_interval;
        tokio::spawn(async move {
            loop {
                device.refresh().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }
            }
            debug!("Polling stopped for {}", device.inner.session.target());
        });
    }

    /// Stop the poll loop and release the transport socket. Does not
    /// change the device's status.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.session.close();
    }
}
