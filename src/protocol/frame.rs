//! Frame building, checksums, and header parsing for both transports.
//!
//! Wire layout (UDP, and the TCP inner frame):
//! - command (2 bytes LE)
//! - checksum (2 bytes LE, computed with this field zeroed)
//! - session id (2 bytes LE)
//! - reply id (2 bytes LE)
//! - payload
//!
//! TCP wraps the same frame in an 8-byte prefix: 4 magic bytes followed by
//! the inner frame length as u32 LE.

use super::commands::USHRT_MAX;
use crate::error::{Result, ZkError};

/// TCP frame prefix magic bytes.
pub const TCP_PREFIX: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];

/// Size of the 8-byte frame header shared by both transports.
pub const HEADER_SIZE: usize = 8;

/// Calculate the ZK protocol checksum over a frame.
///
/// Sums little-endian u16 words (a trailing odd byte is added as-is),
/// folding modulo `USHRT_MAX` after each add, then takes
/// `USHRT_MAX - sum - 1`. The checksum field itself must be zero while
/// summing.
pub fn checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < buf.len() {
        if i == buf.len() - 1 {
            sum += buf[i] as u32;
        } else {
            sum += u16::from_le_bytes([buf[i], buf[i + 1]]) as u32;
        }
        sum %= USHRT_MAX;
        i += 2;
    }
    (USHRT_MAX - sum - 1) as u16
}

/// Build a UDP frame: 8-byte header + payload.
///
/// The wire frame carries the caller's reply id advanced by one (modulo
/// `USHRT_MAX`); the transport keeps the authoritative counter separately.
pub fn build_udp_frame(command: u16, session_id: u16, reply_id: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + data.len()];
    buf[0..2].copy_from_slice(&command.to_le_bytes());
    // checksum placeholder at 2..4
    buf[4..6].copy_from_slice(&session_id.to_le_bytes());
    let wire_reply = ((u32::from(reply_id) + 1) % USHRT_MAX) as u16;
    buf[6..8].copy_from_slice(&wire_reply.to_le_bytes());
    buf[8..].copy_from_slice(data);

    let sum = checksum(&buf);
    buf[2..4].copy_from_slice(&sum.to_le_bytes());
    buf
}

/// Build a TCP frame: 8-byte prefix + UDP-shaped inner frame.
pub fn build_tcp_frame(command: u16, session_id: u16, reply_id: u16, data: &[u8]) -> Vec<u8> {
    let inner = build_udp_frame(command, session_id, reply_id, data);

    let mut packet = Vec::with_capacity(8 + inner.len());
    packet.extend_from_slice(&TCP_PREFIX);
    packet.extend_from_slice(&(inner.len() as u32).to_le_bytes());
    packet.extend_from_slice(&inner);
    packet
}

/// Remove the TCP prefix if present, returning the inner frame.
///
/// Buffers shorter than 8 bytes or not starting with the magic bytes are
/// returned unchanged.
pub fn strip_tcp_prefix(buf: &[u8]) -> &[u8] {
    if buf.len() < 8 || buf[0..4] != TCP_PREFIX {
        return buf;
    }
    &buf[8..]
}

/// Decoded 8-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub command: u16,
    pub checksum: u16,
    pub session_id: u16,
    pub reply_id: u16,
}

/// Parse the 8-byte header at the start of a UDP-shaped frame.
pub fn parse_udp_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(ZkError::InvalidResponse(format!(
            "frame too short for header: {} bytes",
            buf.len()
        )));
    }
    Ok(FrameHeader {
        command: u16::from_le_bytes([buf[0], buf[1]]),
        checksum: u16::from_le_bytes([buf[2], buf[3]]),
        session_id: u16::from_le_bytes([buf[4], buf[5]]),
        reply_id: u16::from_le_bytes([buf[6], buf[7]]),
    })
}

/// Parse the 16-byte TCP front matter: prefix length field + inner header.
///
/// Returns the inner header and the payload size announced by the prefix.
pub fn parse_tcp_header(buf: &[u8]) -> Result<(FrameHeader, u32)> {
    if buf.len() < 16 {
        return Err(ZkError::InvalidResponse(format!(
            "TCP frame too short for header: {} bytes",
            buf.len()
        )));
    }
    let payload_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let header = parse_udp_header(&buf[8..])?;
    Ok((header, payload_size))
}

/// Whether a raw TCP buffer is a real-time event frame.
///
/// TCP event frames carry CMD_REG_EVENT as the command and the event kind
/// overlaid on the session-id field; only EF_ATTLOG frames count.
pub fn is_event_frame_tcp(buf: &[u8]) -> bool {
    use super::commands::{CMD_REG_EVENT, EF_ATTLOG};

    let inner = strip_tcp_prefix(buf);
    if inner.len() < 6 {
        return false;
    }
    let command = u16::from_le_bytes([inner[0], inner[1]]);
    let event = u16::from_le_bytes([inner[4], inner[5]]);
    command == CMD_REG_EVENT && event == EF_ATTLOG
}

/// Whether a raw UDP datagram is a real-time event frame.
pub fn is_event_frame_udp(buf: &[u8]) -> bool {
    use super::commands::CMD_REG_EVENT;

    if buf.len() < HEADER_SIZE {
        return false;
    }
    u16::from_le_bytes([buf[0], buf[1]]) == CMD_REG_EVENT
}
