//! Per-device UDP transport with a bounded retry policy.
//! One socket per device, created lazily and torn down on forced-offline.

use crate::error::Result;
use log::{debug, error, trace};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{Duration, timeout};

/// Default receive timeout per attempt.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_LENGTH: usize = 1024;

/// A UDP socket wrapper that retries a whole send/receive cycle once.
///
/// If the first attempt produces no response (send failure, timeout, or
/// receive error) and the configured retry count is greater than zero,
/// the cycle runs exactly one more time. The extra attempt never recurses
/// regardless of how large the retry count is.
pub struct RetryableSocket {
    target: Mutex<SocketAddr>,
    retries: u32,
    recv_timeout: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl RetryableSocket {
    pub fn new(target: SocketAddr, retries: u32) -> Self {
        Self {
            target: Mutex::new(target),
            retries,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            socket: Mutex::new(None),
        }
    }

    /// Set the per-attempt receive timeout.
    pub fn with_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    /// Point the socket at a new address. Used when rediscovery relocates
    /// a dynamic-IP device.
    pub fn set_target(&self, target: SocketAddr) {
        *self.target.lock() = target;
    }

    pub fn target(&self) -> SocketAddr {
        *self.target.lock()
    }

    /// Send a packet to the device and wait for a response.
    /// Returns None when no response arrived after the allowed attempts.
    pub async fn send_and_receive(&self, message: &[u8], purpose: &str) -> Option<Vec<u8>> {
        if let Some(response) = self.send_and_receive_one_time(message, purpose).await {
            return Some(response);
        }

        if self.retries > 0 {
            trace!("Retrying {} ONE time before giving up...", purpose);
            return self.send_and_receive_one_time(message, purpose).await;
        }

        None
    }

    async fn send_and_receive_one_time(&self, message: &[u8], purpose: &str) -> Option<Vec<u8>> {
        let target = self.target();
        let socket = match self.obtain_socket() {
            Ok(s) => s,
            Err(e) => {
                error!("Could not create socket for {}: {}", purpose, e);
                return None;
            }
        };

        trace!("Sending {} to {}", purpose, target);
        if let Err(e) = socket.send_to(message, target).await {
            error!("IO error during UDP command sending: {}", e);
            return None;
        }
        trace!("Sending {} complete", purpose);

        let mut buf = vec![0u8; RECV_BUFFER_LENGTH];
        match timeout(self.recv_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _addr))) => {
                trace!("Received {} ({} bytes)", purpose, len);
                buf.truncate(len);
                Some(buf)
            }
            Ok(Err(e)) => {
                error!("While {} - IO error: '{}'", purpose, e);
                None
            }
            Err(_) => {
                debug!("No further {} response received for device", purpose);
                None
            }
        }
    }

    /// Lazily create the socket; broadcast and address reuse match what
    /// the devices expect from the vendor app.
    fn obtain_socket(&self) -> Result<Arc<UdpSocket>> {
        let mut guard = self.socket.lock();
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }

        trace!("No existing socket ... creating");
        let bind_addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0));
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(bind_addr))?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    /// Drop the socket. The next send recreates it.
    pub fn close(&self) {
        let mut guard = self.socket.lock();
        if guard.take().is_some() {
            debug!("Socket closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    async fn silent_peer() -> (TokioUdpSocket, SocketAddr) {
        let peer = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        (peer, addr)
    }

    #[tokio::test]
    async fn no_response_with_retries_sends_exactly_twice() {
        let (peer, addr) = silent_peer().await;
        let socket = RetryableSocket::new(addr, 1).with_timeout(Duration::from_millis(50));

        assert!(socket.send_and_receive(b"ping", "test").await.is_none());

        let mut buf = [0u8; 64];
        let mut received = 0;
        while timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
            .await
            .is_ok()
        {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn no_response_without_retries_sends_once() {
        let (peer, addr) = silent_peer().await;
        let socket = RetryableSocket::new(addr, 0).with_timeout(Duration::from_millis(50));

        assert!(socket.send_and_receive(b"ping", "test").await.is_none());

        let mut buf = [0u8; 64];
        let mut received = 0;
        while timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
            .await
            .is_ok()
        {
            received += 1;
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn response_is_returned_without_retry() {
        let (peer, addr) = silent_peer().await;
        let socket = RetryableSocket::new(addr, 1).with_timeout(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(b"pong", from).await.unwrap();
        });

        let response = socket.send_and_receive(b"ping", "test").await;
        assert_eq!(response.as_deref(), Some(&b"pong"[..]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn socket_recreated_after_close() {
        let (peer, addr) = silent_peer().await;
        let socket = RetryableSocket::new(addr, 0).with_timeout(Duration::from_millis(50));

        let _ = socket.send_and_receive(b"one", "test").await;
        socket.close();
        let _ = socket.send_and_receive(b"two", "test").await;

        let mut buf = [0u8; 64];
        let mut received = 0;
        while timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
            .await
            .is_ok()
        {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
