//! Broadlink wire protocol implementation.
//! Pure packet framing, checksums and payload layouts; no I/O.

use crate::crypto::DeviceCipher;
use crate::error::{BroadlinkError, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, Local, Timelike};

/// Seed for the protocol's rolling 16-bit checksum.
pub const CHECKSUM_SEED: u16 = 0xBEAF;

/// Size of the command packet header, before the encrypted payload.
pub const HEADER_LENGTH: usize = 56;

/// Range of the response buffer holding the first encrypted payload block,
/// used by every current message type.
pub const RESPONSE_PAYLOAD_RANGE: std::ops::Range<usize> = 56..88;

/// Offset of the device-reported error code in a raw response.
pub const ERROR_CODE_OFFSET: usize = 34;

/// Factory authorization key every unauthenticated device accepts.
pub const DEFAULT_AUTH_KEY: [u8; 16] = [
    0x09, 0x76, 0x28, 0x34, 0x3f, 0xe9, 0x9e, 0x23, 0x76, 0x5c, 0x15, 0x13, 0xac, 0xcf, 0x8b,
    0x02,
];

/// Fixed IV shared by every packet in the protocol.
pub const DEFAULT_IV: [u8; 16] = [
    0x56, 0x2e, 0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f,
    0x58,
];

/// Command codes understood by the packet envelope.
///
/// Device families reuse `DeviceControl` (0x6a) with family-specific
/// payload layouts; those layouts live with the device handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    /// Discovery broadcast marker byte
    Discover = 0x06,
    /// Authentication handshake
    Auth = 0x65,
    /// Legacy set command used only by the first-generation SP1 socket
    Sp1Control = 0x66,
    /// Status read / state write envelope shared across device families
    DeviceControl = 0x6a,
}

/// The device families reachable through this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Sp1,
    Sp2,
    Sp3,
    Rm,
    Rm2,
    Rm3,
    A1,
    Mp1,
    Mp2,
    S1c,
}

impl DeviceKind {
    /// Map the 16-bit model code from a discovery reply to a device family.
    pub fn from_model(model: u16) -> Option<DeviceKind> {
        match model {
            0 => Some(DeviceKind::Sp1),
            0x2711 => Some(DeviceKind::Sp2),
            // Honeywell-branded SP2
            0x2719 | 0x7919 | 0x271a | 0x791a => Some(DeviceKind::Sp2),
            // SPMini, SPMini2, OEM SPMini, SPMiniPlus
            0x2720 | 0x2728 | 0x2733 | 0x273e | 0x2736 => Some(DeviceKind::Sp2),
            0x753e => Some(DeviceKind::Sp3),
            // OEM-branded SP3
            0x7d00 => Some(DeviceKind::Sp3),
            // Actually an SP3S
            0x947a | 0x9479 => Some(DeviceKind::Sp3),
            // OEM-branded SPMini2
            0x7530..=0x7918 => Some(DeviceKind::Sp2),
            10002 | 10026 | 10108 | 10115 | 10119 | 10123 => Some(DeviceKind::Rm2),
            10039 => Some(DeviceKind::Rm3),
            10045 | 10127 => Some(DeviceKind::Rm),
            10004 => Some(DeviceKind::A1),
            20149 | 20215 => Some(DeviceKind::Mp1),
            20251 => Some(DeviceKind::Mp2),
            10018 => Some(DeviceKind::S1c),
            _ => None,
        }
    }
}

/// A reply collected from the shared discovery socket.
#[derive(Debug, Clone)]
pub struct DiscoveryReply {
    /// Responding device address
    pub addr: std::net::IpAddr,
    /// Responding device source port
    pub port: u16,
    /// Device MAC, in wire order (render with [`format_mac`])
    pub mac: [u8; 6],
    /// Raw 16-bit model code
    pub model: u16,
    /// Device family for the model code, if known
    pub kind: Option<DeviceKind>,
}

/// Rolling 16-bit checksum: seed 0xBEAF, add each unsigned byte, truncate.
/// Used both for the payload checksum and the whole-packet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = CHECKSUM_SEED as u32;
    for &b in data {
        sum = (sum + b as u32) & 0xffff;
    }
    sum as u16
}

/// Assemble an encrypted command packet.
///
/// The payload length must be a multiple of 16 bytes; callers pre-pad.
/// `device_id` is all zeros until the handshake has produced one.
pub fn build_message(
    command: u8,
    payload: &[u8],
    count: u16,
    mac: &[u8; 6],
    device_id: &[u8; 4],
    cipher: &DeviceCipher,
) -> Result<Vec<u8>> {
    let mut packet = vec![0u8; HEADER_LENGTH];
    packet[0] = 0x5a;
    packet[1] = 0xa5;
    packet[2] = 0xaa;
    packet[3] = 0x55;
    packet[4] = 0x5a;
    packet[5] = 0xa5;
    packet[6] = 0xaa;
    packet[7] = 0x55;
    packet[36] = 0x2a;
    packet[37] = 0x27;
    packet[38] = command;
    LittleEndian::write_u16(&mut packet[40..42], count);
    packet[42..48].copy_from_slice(mac);
    packet[48..52].copy_from_slice(device_id);
    LittleEndian::write_u16(&mut packet[52..54], checksum(payload));

    packet.extend_from_slice(&cipher.encrypt(payload)?);

    // Whole-packet checksum is computed over the assembled, encrypted
    // buffer and patched in last.
    let full = checksum(&packet);
    LittleEndian::write_u16(&mut packet[32..34], full);
    Ok(packet)
}

/// Decode a raw response: check the device-reported error code, then
/// decrypt the first encrypted block range with the resolved cipher
/// (authorization key before the handshake, device key after).
pub fn decode_packet(raw: &[u8], cipher: &DeviceCipher) -> Result<Vec<u8>> {
    if raw.len() < RESPONSE_PAYLOAD_RANGE.end {
        return Err(BroadlinkError::InvalidPacket);
    }
    let error = LittleEndian::read_u16(&raw[ERROR_CODE_OFFSET..ERROR_CODE_OFFSET + 2]);
    if error != 0 {
        return Err(BroadlinkError::Protocol(error));
    }
    cipher.decrypt(&raw[RESPONSE_PAYLOAD_RANGE])
}

/// Build the fixed 80-byte authentication payload sent as command 0x65.
pub fn auth_payload() -> [u8; 80] {
    let mut payload = [0u8; 80];
    for b in &mut payload[4..=18] {
        *b = 0x31;
    }
    payload[0x13] = 0x01;
    payload[30] = 0x01;
    payload[45] = 0x01;
    payload[48..55].copy_from_slice(b"Test  1");
    payload
}

/// Extract the session credentials from a decrypted authentication
/// response: device id at bytes 0-3, device key at bytes 4-19.
pub fn parse_auth_response(plaintext: &[u8]) -> Result<([u8; 4], [u8; 16])> {
    if plaintext.len() < 20 {
        return Err(BroadlinkError::HandshakeFailed);
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&plaintext[0..4]);
    let mut key = [0u8; 16];
    key.copy_from_slice(&plaintext[4..20]);
    Ok((id, key))
}

/// Build the 48-byte discovery broadcast packet. It carries the local
/// timezone offset, current date/time, and the address/port replies
/// should be aimed at.
pub fn build_discovery_packet(local_ip: std::net::Ipv4Addr, local_port: u16) -> [u8; 48] {
    let now = Local::now();
    let offset_hours = now.offset().local_minus_utc() / 3600;

    let mut packet = [0u8; 48];
    if offset_hours < 0 {
        packet[8] = (0xff + offset_hours - 1) as u8;
        packet[9] = 0xff;
        packet[10] = 0xff;
        packet[11] = 0xff;
    } else {
        packet[8] = offset_hours as u8;
    }
    let year = now.year();
    LittleEndian::write_u16(&mut packet[12..14], year as u16);
    packet[14] = now.minute() as u8;
    packet[15] = now.hour() as u8;
    packet[16] = (year - 2000) as u8;
    packet[17] = now.weekday().num_days_from_monday() as u8;
    packet[18] = now.day() as u8;
    packet[19] = now.month() as u8;
    packet[24..28].copy_from_slice(&local_ip.octets());
    LittleEndian::write_u16(&mut packet[28..30], local_port);
    packet[38] = CommandCode::Discover as u8;

    let sum = checksum(&packet);
    LittleEndian::write_u16(&mut packet[32..34], sum);
    packet
}

/// Parse a discovery reply datagram: MAC at bytes 58-63, model code
/// LE16 at 52-53. Returns None for runt packets.
pub fn parse_discovery_response(
    raw: &[u8],
    addr: std::net::IpAddr,
    port: u16,
) -> Option<DiscoveryReply> {
    if raw.len() < 64 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&raw[58..64]);
    let model = LittleEndian::read_u16(&raw[52..54]);
    Some(DiscoveryReply {
        addr,
        port,
        mac,
        model,
        kind: DeviceKind::from_model(model),
    })
}

/// Render a MAC address as the protocol does: wire bytes reversed,
/// colon separated, lowercase hex.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .rev()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Render a MAC that is already in configured (wire) byte order.
pub fn format_mac_configured(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a "aa:bb:cc:dd:ee:ff" string into configured (wire) byte order.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(BroadlinkError::ConfigError(format!("bad MAC '{}'", mac)));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| BroadlinkError::ConfigError(format!("bad MAC '{}'", mac)))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> DeviceCipher {
        DeviceCipher::new(&[0x11u8; 16], &[0x22u8; 16]).unwrap()
    }

    #[test]
    fn checksum_is_deterministic() {
        let data = [0u8, 1, 2, 250, 251, 252];
        assert_eq!(checksum(&data), checksum(&data));
        assert_eq!(checksum(&[]), CHECKSUM_SEED);
    }

    #[test]
    fn checksum_truncates_to_16_bits() {
        let data = vec![0xffu8; 1024];
        let expected = ((CHECKSUM_SEED as u32 + 1024 * 0xff) & 0xffff) as u16;
        assert_eq!(checksum(&data), expected);
    }

    #[test]
    fn message_header_layout() {
        let payload = [0u8; 16];
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let id = [1, 2, 3, 4];
        let msg = build_message(0x6a, &payload, 0x1234, &mac, &id, &test_cipher()).unwrap();

        assert_eq!(msg.len(), HEADER_LENGTH + 16);
        assert_eq!(&msg[0..8], &[0x5a, 0xa5, 0xaa, 0x55, 0x5a, 0xa5, 0xaa, 0x55]);
        assert_eq!(&msg[36..38], &[0x2a, 0x27]);
        assert_eq!(msg[38], 0x6a);
        assert_eq!(LittleEndian::read_u16(&msg[40..42]), 0x1234);
        assert_eq!(&msg[42..48], &mac);
        assert_eq!(&msg[48..52], &id);
        assert_eq!(LittleEndian::read_u16(&msg[52..54]), checksum(&payload));
    }

    #[test]
    fn whole_packet_checksum_is_patched_last() {
        let payload = [0x42u8; 32];
        let msg = build_message(
            0x65,
            &payload,
            7,
            &[0u8; 6],
            &[0u8; 4],
            &test_cipher(),
        )
        .unwrap();

        let stored = LittleEndian::read_u16(&msg[32..34]);
        let mut unpatched = msg.clone();
        unpatched[32] = 0;
        unpatched[33] = 0;
        assert_eq!(stored, checksum(&unpatched));
    }

    #[test]
    fn auth_payload_literals() {
        let payload = auth_payload();
        assert_eq!(payload.len(), 80);
        for i in 4..=18 {
            assert_eq!(payload[i], 0x31);
        }
        assert_eq!(payload[0x13], 0x01);
        assert_eq!(payload[30], 0x01);
        assert_eq!(payload[45], 0x01);
        assert_eq!(&payload[48..55], b"Test  1");
    }

    #[test]
    fn decode_rejects_device_error_code() {
        let mut raw = vec![0u8; 88];
        raw[34] = 0x01; // error 0x0001, little endian
        assert_eq!(
            decode_packet(&raw, &test_cipher()).unwrap_err(),
            BroadlinkError::Protocol(1)
        );
    }

    #[test]
    fn decode_rejects_runt_packet() {
        assert_eq!(
            decode_packet(&[0u8; 60], &test_cipher()).unwrap_err(),
            BroadlinkError::InvalidPacket
        );
    }

    #[test]
    fn decode_recovers_encrypted_payload() {
        let cipher = test_cipher();
        let plaintext = [0x37u8; 32];
        let mut raw = vec![0u8; 56];
        raw.extend_from_slice(&cipher.encrypt(&plaintext).unwrap());
        assert_eq!(decode_packet(&raw, &cipher).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn auth_response_extraction() {
        let mut plaintext = vec![0u8; 32];
        plaintext[0..4].copy_from_slice(&[9, 8, 7, 6]);
        for (i, b) in plaintext[4..20].iter_mut().enumerate() {
            *b = i as u8;
        }
        let (id, key) = parse_auth_response(&plaintext).unwrap();
        assert_eq!(id, [9, 8, 7, 6]);
        assert_eq!(key[0], 0);
        assert_eq!(key[15], 15);
    }

    #[test]
    fn discovery_packet_layout() {
        let packet = build_discovery_packet(std::net::Ipv4Addr::new(192, 168, 1, 17), 2770);
        assert_eq!(packet.len(), 48);
        assert_eq!(&packet[24..28], &[192, 168, 1, 17]);
        assert_eq!(LittleEndian::read_u16(&packet[28..30]), 2770);
        assert_eq!(packet[38], 0x06);
        // Weekday counts from Monday as zero
        assert!(packet[17] <= 6);

        let stored = LittleEndian::read_u16(&packet[32..34]);
        let mut unpatched = packet;
        unpatched[32] = 0;
        unpatched[33] = 0;
        assert_eq!(stored, checksum(&unpatched));
    }

    #[test]
    fn discovery_reply_parsing() {
        let mut raw = vec![0u8; 128];
        raw[52] = 0x14; // model 10004 = A1
        raw[53] = 0x27;
        raw[58..64].copy_from_slice(&[0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa]);
        let reply =
            parse_discovery_response(&raw, "192.168.1.5".parse().unwrap(), 80).unwrap();
        assert_eq!(reply.model, 10004);
        assert_eq!(reply.kind, Some(DeviceKind::A1));
        assert_eq!(format_mac(&reply.mac), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn discovery_reply_too_short() {
        assert!(parse_discovery_response(&[0u8; 60], "10.0.0.1".parse().unwrap(), 80).is_none());
    }

    #[test]
    fn model_map_families() {
        assert_eq!(DeviceKind::from_model(0), Some(DeviceKind::Sp1));
        assert_eq!(DeviceKind::from_model(0x2711), Some(DeviceKind::Sp2));
        // 0x753e sits inside the OEM SPMini2 range but is an SP3
        assert_eq!(DeviceKind::from_model(0x753e), Some(DeviceKind::Sp3));
        assert_eq!(DeviceKind::from_model(0x7531), Some(DeviceKind::Sp2));
        assert_eq!(DeviceKind::from_model(0x947a), Some(DeviceKind::Sp3));
        assert_eq!(DeviceKind::from_model(10039), Some(DeviceKind::Rm3));
        assert_eq!(DeviceKind::from_model(20149), Some(DeviceKind::Mp1));
        assert_eq!(DeviceKind::from_model(20251), Some(DeviceKind::Mp2));
        assert_eq!(DeviceKind::from_model(10018), Some(DeviceKind::S1c));
        assert_eq!(DeviceKind::from_model(0xffff), None);
    }

    #[test]
    fn mac_parse_and_format_round_trip() {
        let wire = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(wire, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        // Rendering reverses wire order
        assert_eq!(format_mac(&wire), "ff:ee:dd:cc:bb:aa");
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("zz:bb:cc:dd:ee:ff").is_err());
    }
}
