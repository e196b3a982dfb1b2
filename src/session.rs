//! Per-device session state: handshake credentials, packet counter,
//! and the command build/send/decode cycle.

use crate::crypto::DeviceCipher;
use crate::error::{BroadlinkError, Result};
use crate::protocol::{self, CommandCode};
use crate::transport::RetryableSocket;
use log::{debug, error, trace};
use parking_lot::RwLock;
use rand::Rng;
use std::net::SocketAddr;

/// Device id and key issued by the device during the handshake.
/// Valid for this session only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub device_id: [u8; 4],
    pub device_key: [u8; 16],
}

struct SessionState {
    credentials: Option<SessionCredentials>,
    count: u16,
    authenticated: bool,
}

/// One session with one physical device.
///
/// Owns the authorization-key cipher, the credentials learned from the
/// handshake, the rolling packet counter and the device's UDP transport.
pub struct DeviceSession {
    mac: [u8; 6],
    iv: [u8; 16],
    auth_cipher: DeviceCipher,
    state: RwLock<SessionState>,
    transport: RetryableSocket,
}

impl DeviceSession {
    /// Create a session. The packet counter starts at a random value;
    /// real devices tolerate arbitrary starting counters.
    pub fn new(
        mac: [u8; 6],
        auth_key: &[u8],
        iv: &[u8],
        transport: RetryableSocket,
    ) -> Result<Self> {
        let auth_cipher = DeviceCipher::new(auth_key, iv)?;
        let mut iv_bytes = [0u8; 16];
        iv_bytes.copy_from_slice(iv);
        Ok(Self {
            mac,
            iv: iv_bytes,
            auth_cipher,
            state: RwLock::new(SessionState {
                credentials: None,
                count: rand::rng().random(),
                authenticated: false,
            }),
            transport,
        })
    }

    pub fn counter(&self) -> u16 {
        self.state.read().count
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    pub fn credentials(&self) -> Option<SessionCredentials> {
        self.state.read().credentials.clone()
    }

    /// The cipher for the current phase of the session: device key once
    /// the handshake has produced one, authorization key before that.
    fn active_cipher(&self) -> Result<DeviceCipher> {
        match self.state.read().credentials.as_ref() {
            Some(creds) => DeviceCipher::new(&creds.device_key, &self.iv),
            None => Ok(self.auth_cipher.clone()),
        }
    }

    /// Build a command packet, advancing the packet counter.
    /// The counter advances on every build, successful exchange or not.
    pub fn build_command(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let (count, credentials) = {
            let mut state = self.state.write();
            state.count = state.count.wrapping_add(1);
            (state.count, state.credentials.clone())
        };

        let (cipher, device_id) = match credentials {
            Some(creds) => (
                DeviceCipher::new(&creds.device_key, &self.iv)?,
                creds.device_id,
            ),
            None => (self.auth_cipher.clone(), [0u8; 4]),
        };
        trace!("Building message with id {:?}", device_id);
        protocol::build_message(command, payload, count, &self.mac, &device_id, &cipher)
    }

    /// Raw exchange for device-specific handlers that decode their own
    /// responses.
    pub async fn send_and_receive(&self, message: &[u8], purpose: &str) -> Option<Vec<u8>> {
        self.transport.send_and_receive(message, purpose).await
    }

    /// Build, send, and decode one command round trip.
    pub async fn execute(&self, command: u8, payload: &[u8], purpose: &str) -> Result<Vec<u8>> {
        let message = self.build_command(command, payload)?;
        let response = self
            .transport
            .send_and_receive(&message, purpose)
            .await
            .ok_or(BroadlinkError::Timeout)?;
        protocol::decode_packet(&response, &self.active_cipher()?)
    }

    /// Run the authentication handshake. On success the device-issued
    /// id/key are stored for the rest of the session; on any failure
    /// nothing is stored (the counter still advanced for the packet
    /// that went out).
    pub async fn authenticate(&self) -> bool {
        match self.try_authenticate().await {
            Ok(()) => true,
            Err(e) => {
                error!("Authentication failed: {}", e);
                false
            }
        }
    }

    async fn try_authenticate(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.credentials = None;
            state.authenticated = false;
        }
        debug!("Authenticating with packet count = {}", self.counter());

        let payload = protocol::auth_payload();
        let message = self.build_command(CommandCode::Auth as u8, &payload)?;
        let response = self
            .transport
            .send_and_receive(&message, "authentication")
            .await
            .ok_or(BroadlinkError::Timeout)?;

        // The handshake response is always under the authorization key.
        let plaintext = protocol::decode_packet(&response, &self.auth_cipher)?;
        let (device_id, device_key) = protocol::parse_auth_response(&plaintext)?;
        debug!(
            "Authenticated with id '{}' and key '{}'",
            hex::encode(device_id),
            hex::encode(device_key)
        );

        let mut state = self.state.write();
        state.credentials = Some(SessionCredentials {
            device_id,
            device_key,
        });
        state.authenticated = true;
        Ok(())
    }

    /// Forget the session credentials. The next exchange will need a
    /// fresh handshake. The packet counter keeps rolling; it wraps
    /// naturally and is never reset.
    pub fn clear(&self) {
        debug!("Clearing session credentials");
        let mut state = self.state.write();
        state.credentials = None;
        state.authenticated = false;
    }

    /// Re-aim the transport, used when rediscovery relocates the device.
    pub fn set_target(&self, target: SocketAddr) {
        self.transport.set_target(target);
    }

    pub fn target(&self) -> SocketAddr {
        self.transport.target()
    }

    /// Tear down the transport socket.
    pub fn close(&self) {
        self.transport.close();
    }
}
