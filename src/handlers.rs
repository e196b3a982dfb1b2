//! Family-specific command payloads and response decoding, layered over
//! the shared session. Each handler knows one family's 0x6a payload
//! dialect; the envelope, crypto and retries all live below.

use crate::device::DeviceHandler;
use crate::error::{BroadlinkError, Result};
use crate::protocol::CommandCode;
use crate::session::DeviceSession;
use async_trait::async_trait;
use log::{debug, trace};

const PAYLOAD_LENGTH: usize = 16;

/// Ambient light buckets reported by the A1 sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightLevel {
    Dark,
    Dim,
    Normal,
    Bright,
}

impl LightLevel {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Dark),
            1 => Some(Self::Dim),
            2 => Some(Self::Normal),
            3 => Some(Self::Bright),
            _ => None,
        }
    }
}

/// Air quality buckets reported by the A1 sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirQuality {
    Perfect,
    Good,
    Normal,
    Bad,
}

impl AirQuality {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Perfect),
            1 => Some(Self::Good),
            2 => Some(Self::Normal),
            3 => Some(Self::Bad),
            _ => None,
        }
    }
}

/// Noise buckets reported by the A1 sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseLevel {
    Quiet,
    Normal,
    Noisy,
    Extreme,
}

impl NoiseLevel {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Quiet),
            1 => Some(Self::Normal),
            2 => Some(Self::Noisy),
            3 => Some(Self::Extreme),
            _ => None,
        }
    }
}

/// One A1 environmental sample. The bucketed fields are `None` when the
/// device reports a code outside its documented range.
#[derive(Debug, Clone, PartialEq)]
pub struct A1Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub light: Option<LightLevel>,
    pub air_quality: Option<AirQuality>,
    pub noise: Option<NoiseLevel>,
}

fn parse_a1(payload: &[u8]) -> Result<A1Reading> {
    if payload.len() < 13 {
        return Err(BroadlinkError::InvalidPacket);
    }
    Ok(A1Reading {
        temperature: (payload[4] as f32 * 10.0 + payload[5] as f32) / 10.0,
        humidity: (payload[6] as f32 * 10.0 + payload[7] as f32) / 10.0,
        light: LightLevel::from_byte(payload[8]),
        air_quality: AirQuality::from_byte(payload[10]),
        noise: NoiseLevel::from_byte(payload[12]),
    })
}

/// A1 environmental sensor.
pub struct A1Sensor;

impl A1Sensor {
    pub async fn read(&self, session: &DeviceSession) -> Result<A1Reading> {
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload[0] = 1;
        let decoded = session
            .execute(CommandCode::DeviceControl as u8, &payload, "sensor read")
            .await?;
        let reading = parse_a1(&decoded)?;
        trace!("Sensor reading: {:?}", reading);
        Ok(reading)
    }
}

#[async_trait]
impl DeviceHandler for A1Sensor {
    async fn get_status(&self, session: &DeviceSession) -> Result<()> {
        self.read(session).await.map(|_| ())
    }
}

/// SP1 first-generation socket, driven by the legacy set command.
pub struct Sp1Switch;

impl Sp1Switch {
    /// Switch the relay. The SP1 acknowledges but never reports state,
    /// so the reply is not decoded.
    pub async fn set_power(&self, session: &DeviceSession, on: bool) -> Result<()> {
        debug!("Switching socket {}", if on { "on" } else { "off" });
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload[0] = on as u8;
        let message = session.build_command(CommandCode::Sp1Control as u8, &payload)?;
        session
            .send_and_receive(&message, "state write")
            .await
            .ok_or(BroadlinkError::Timeout)?;
        Ok(())
    }
}

#[async_trait]
impl DeviceHandler for Sp1Switch {
    /// The SP1 cannot be queried; connectivity alone decides its status.
    async fn get_status(&self, _session: &DeviceSession) -> Result<()> {
        Ok(())
    }
}

fn energy_read_payload() -> [u8; PAYLOAD_LENGTH] {
    let mut payload = [0u8; PAYLOAD_LENGTH];
    payload[0] = 8;
    payload[2] = 0xfe;
    payload[3] = 1;
    payload[4] = 5;
    payload[5] = 1;
    payload[9] = 0x2d;
    payload
}

/// Consumption comes back as three BCD bytes: ten-thousands of watts at
/// byte 7 down to hundredths at byte 5.
fn parse_energy(payload: &[u8]) -> Result<f32> {
    if payload.len() < 8 {
        return Err(BroadlinkError::InvalidPacket);
    }
    let bcd = |b: u8| (b >> 4) as u32 * 10 + (b & 0x0f) as u32;
    let hundredths = bcd(payload[7]) * 10000 + bcd(payload[6]) * 100 + bcd(payload[5]);
    Ok(hundredths as f32 / 100.0)
}

/// SP2/SP3 single smart socket.
pub struct SocketSwitch;

impl SocketSwitch {
    /// Read the relay state.
    pub async fn power(&self, session: &DeviceSession) -> Result<bool> {
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload[0] = 1;
        let decoded = session
            .execute(CommandCode::DeviceControl as u8, &payload, "status read")
            .await?;
        if decoded.len() < 5 {
            return Err(BroadlinkError::InvalidPacket);
        }
        Ok(decoded[4] & 1 == 1)
    }

    /// Switch the relay.
    pub async fn set_power(&self, session: &DeviceSession, on: bool) -> Result<()> {
        debug!("Switching socket {}", if on { "on" } else { "off" });
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload[0] = 2;
        payload[4] = on as u8;
        session
            .execute(CommandCode::DeviceControl as u8, &payload, "state write")
            .await?;
        Ok(())
    }

    /// Cumulative power consumption in watts, on metering models (SP3S).
    pub async fn energy(&self, session: &DeviceSession) -> Result<f32> {
        let decoded = session
            .execute(
                CommandCode::DeviceControl as u8,
                &energy_read_payload(),
                "consumption read",
            )
            .await?;
        parse_energy(&decoded)
    }
}

#[async_trait]
impl DeviceHandler for SocketSwitch {
    async fn get_status(&self, session: &DeviceSession) -> Result<()> {
        self.power(session).await.map(|_| ())
    }
}

fn strip_socket_mask(socket: u8) -> Result<u8> {
    if !(1..=4).contains(&socket) {
        return Err(BroadlinkError::ConfigError(format!(
            "power strip socket must be 1-4, got {}",
            socket
        )));
    }
    Ok(1 << (socket - 1))
}

fn strip_set_payload(mask: u8, on: bool) -> [u8; PAYLOAD_LENGTH] {
    let mut payload = [0u8; PAYLOAD_LENGTH];
    payload[0] = 0x0d;
    payload[2] = 0xa5;
    payload[3] = 0xa5;
    payload[4] = 0x5a;
    payload[5] = 0x5a;
    payload[6] = 0xb2u8.wrapping_add(if on { mask << 1 } else { mask });
    payload[7] = 0xc0;
    payload[8] = 0x02;
    payload[10] = 0x03;
    payload[13] = mask;
    payload[14] = if on { mask } else { 0 };
    payload
}

fn strip_status_payload() -> [u8; PAYLOAD_LENGTH] {
    let mut payload = [0u8; PAYLOAD_LENGTH];
    payload[0] = 0x0a;
    payload[2] = 0xa5;
    payload[3] = 0xa5;
    payload[4] = 0x5a;
    payload[5] = 0x5a;
    payload[6] = 0xae;
    payload[7] = 0xc0;
    payload[8] = 0x01;
    payload
}

/// MP1 four-socket power strip.
pub struct PowerStrip;

impl PowerStrip {
    /// Switch one of the four sockets (numbered 1-4).
    pub async fn set_power(&self, session: &DeviceSession, socket: u8, on: bool) -> Result<()> {
        let mask = strip_socket_mask(socket)?;
        debug!(
            "Switching strip socket {} {}",
            socket,
            if on { "on" } else { "off" }
        );
        session
            .execute(
                CommandCode::DeviceControl as u8,
                &strip_set_payload(mask, on),
                "state write",
            )
            .await?;
        Ok(())
    }

    /// Read all four socket states as a bitmask, socket 1 in bit 0.
    pub async fn power_mask(&self, session: &DeviceSession) -> Result<u8> {
        let decoded = session
            .execute(
                CommandCode::DeviceControl as u8,
                &strip_status_payload(),
                "status read",
            )
            .await?;
        if decoded.len() < 15 {
            return Err(BroadlinkError::InvalidPacket);
        }
        Ok(decoded[14])
    }

    /// Read one socket's state.
    pub async fn power(&self, session: &DeviceSession, socket: u8) -> Result<bool> {
        let mask = strip_socket_mask(socket)?;
        Ok(self.power_mask(session).await? & mask != 0)
    }
}

#[async_trait]
impl DeviceHandler for PowerStrip {
    async fn get_status(&self, session: &DeviceSession) -> Result<()> {
        self.power_mask(session).await.map(|_| ())
    }
}

/// RM family IR/RF blaster.
pub struct RemoteBlaster;

impl RemoteBlaster {
    /// Transmit a raw learned code. The four-byte send envelope plus the
    /// code must land on a 16-byte boundary; codes are stored pre-padded.
    pub async fn send_code(&self, session: &DeviceSession, code: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + code.len());
        payload.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(code);
        if !payload.len().is_multiple_of(PAYLOAD_LENGTH) {
            return Err(BroadlinkError::ConfigError(format!(
                "remote code of {} bytes does not fill whole blocks",
                code.len()
            )));
        }
        session
            .execute(CommandCode::DeviceControl as u8, &payload, "code send")
            .await?;
        Ok(())
    }

    /// Ambient temperature, on models with the sensor (RM2).
    pub async fn temperature(&self, session: &DeviceSession) -> Result<f32> {
        let mut payload = [0u8; PAYLOAD_LENGTH];
        payload[0] = 1;
        let decoded = session
            .execute(CommandCode::DeviceControl as u8, &payload, "sensor read")
            .await?;
        if decoded.len() < 6 {
            return Err(BroadlinkError::InvalidPacket);
        }
        Ok((decoded[4] as f32 * 10.0 + decoded[5] as f32) / 10.0)
    }
}

#[async_trait]
impl DeviceHandler for RemoteBlaster {
    /// Blasters have no state worth polling; connectivity alone decides
    /// their status.
    async fn get_status(&self, _session: &DeviceSession) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceCipher;
    use crate::protocol::{DEFAULT_AUTH_KEY, DEFAULT_IV};
    use crate::transport::RetryableSocket;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;
    use tokio::time::Duration;

    #[test]
    fn a1_reading_decodes_all_fields() {
        let mut payload = [0u8; 16];
        payload[4] = 2; // 21.7 C
        payload[5] = 17;
        payload[6] = 4; // 48.2 %
        payload[7] = 82;
        payload[8] = 3;
        payload[10] = 0;
        payload[12] = 2;
        let reading = parse_a1(&payload).unwrap();
        assert_eq!(reading.temperature, 21.7);
        assert_eq!(reading.humidity, 48.2);
        assert_eq!(reading.light, Some(LightLevel::Bright));
        assert_eq!(reading.air_quality, Some(AirQuality::Perfect));
        assert_eq!(reading.noise, Some(NoiseLevel::Noisy));
    }

    #[test]
    fn a1_reading_tolerates_out_of_range_buckets() {
        let mut payload = [0u8; 16];
        payload[8] = 9;
        payload[10] = 9;
        payload[12] = 9;
        let reading = parse_a1(&payload).unwrap();
        assert_eq!(reading.light, None);
        assert_eq!(reading.air_quality, None);
        assert_eq!(reading.noise, None);
    }

    #[test]
    fn energy_payload_matches_wire_dialect() {
        let payload = energy_read_payload();
        assert_eq!(payload[0], 8);
        assert_eq!(payload[2], 0xfe);
        assert_eq!(payload[3], 1);
        assert_eq!(payload[4], 5);
        assert_eq!(payload[5], 1);
        assert_eq!(payload[9], 0x2d);
    }

    #[test]
    fn energy_decodes_bcd_bytes() {
        let mut payload = [0u8; 16];
        payload[5] = 0x23; // hundredths
        payload[6] = 0x45;
        payload[7] = 0x01;
        // (1 * 10000 + 45 * 100 + 23) / 100
        assert_eq!(parse_energy(&payload).unwrap(), 145.23);
        assert!(parse_energy(&payload[..6]).is_err());
    }

    #[test]
    fn strip_payloads_match_wire_dialect() {
        let set = strip_set_payload(0b0100, true);
        assert_eq!(set[0], 0x0d);
        assert_eq!(set[6], 0xb2 + 0b1000);
        assert_eq!(set[13], 0b0100);
        assert_eq!(set[14], 0b0100);

        let clear = strip_set_payload(0b0100, false);
        assert_eq!(clear[6], 0xb2 + 0b0100);
        assert_eq!(clear[14], 0);

        let status = strip_status_payload();
        assert_eq!(status[0], 0x0a);
        assert_eq!(status[6], 0xae);
        assert_eq!(status[8], 0x01);
    }

    #[test]
    fn strip_rejects_bad_socket_numbers() {
        assert!(strip_socket_mask(0).is_err());
        assert!(strip_socket_mask(5).is_err());
        assert_eq!(strip_socket_mask(4).unwrap(), 0b1000);
    }

    /// Fake device answering one packet with `plaintext` encrypted under
    /// the factory key.
    async fn fake_device(plaintext: [u8; 32]) -> SocketAddr {
        let cipher = DeviceCipher::new(&DEFAULT_AUTH_KEY, &DEFAULT_IV).unwrap();
        let mut response = vec![0u8; 56];
        response.extend_from_slice(&cipher.encrypt(&plaintext).unwrap());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&response, from).await.unwrap();
        });
        addr
    }

    fn session_for(addr: SocketAddr) -> DeviceSession {
        let transport = RetryableSocket::new(addr, 0).with_timeout(Duration::from_millis(200));
        DeviceSession::new(
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            &DEFAULT_AUTH_KEY,
            &DEFAULT_IV,
            transport,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn socket_switch_reads_power_bit() {
        let mut plaintext = [0u8; 32];
        plaintext[4] = 0x01;
        let session = session_for(fake_device(plaintext).await);

        assert!(SocketSwitch.power(&session).await.unwrap());
    }

    #[tokio::test]
    async fn power_strip_reads_status_mask() {
        let mut plaintext = [0u8; 32];
        plaintext[14] = 0b0101;
        let session = session_for(fake_device(plaintext).await);

        assert_eq!(PowerStrip.power_mask(&session).await.unwrap(), 0b0101);
    }

    /// Records the raw packet it receives and acknowledges with a short
    /// datagram, like an SP1 does.
    async fn capturing_device() -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&[0u8; 8], from).await.unwrap();
            let _ = tx.send(buf[..len].to_vec());
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn sp1_set_uses_legacy_command_byte() {
        let (addr, captured) = capturing_device().await;
        let session = session_for(addr);

        Sp1Switch.set_power(&session, true).await.unwrap();

        let raw = captured.await.unwrap();
        assert_eq!(raw[38], 0x66);
        let cipher = DeviceCipher::new(&DEFAULT_AUTH_KEY, &DEFAULT_IV).unwrap();
        let plaintext = cipher.decrypt(&raw[56..]).unwrap();
        assert_eq!(plaintext[0], 1);
    }

    #[tokio::test]
    async fn remote_rejects_unaligned_code() {
        let session = session_for("127.0.0.1:9".parse().unwrap());
        let err = RemoteBlaster
            .send_code(&session, &[0x26, 0x00, 0x0a])
            .await
            .unwrap_err();
        assert!(matches!(err, BroadlinkError::ConfigError(_)));
    }

    #[tokio::test]
    async fn remote_accepts_aligned_code() {
        let session = session_for(fake_device([0u8; 32]).await);
        // 12 code bytes + 4 envelope bytes = one block.
        RemoteBlaster
            .send_code(&session, &[0u8; 12])
            .await
            .unwrap();
    }
}
