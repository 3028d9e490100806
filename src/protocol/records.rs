//! Fixed-layout record codecs: users, attendance logs, real-time events.
//!
//! TCP and UDP responses use different record widths for the same entity;
//! the transport in use selects which decoder applies.

use chrono::NaiveDateTime;

use super::time::{decode_compact, decode_sextet};

/// User record width in TCP bulk responses.
pub const USER_RECORD_TCP: usize = 72;
/// User record width in UDP bulk responses.
pub const USER_RECORD_UDP: usize = 28;
/// Attendance record width in TCP bulk responses.
pub const ATT_RECORD_TCP: usize = 40;
/// Attendance record width in UDP bulk responses.
pub const ATT_RECORD_UDP: usize = 16;

/// A user stored on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Internal record slot (1..=3000).
    pub uid: u16,
    /// Device user id, the badge number shown on the terminal.
    pub user_id: String,
    pub name: String,
    pub role: u8,
    pub password: String,
    pub card_no: u32,
}

/// A single attendance punch read from the device log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    /// Sequence number of the record on the device.
    pub user_sn: u16,
    /// Device user id of the person who punched.
    pub device_user_id: String,
    /// Punch time (device wall clock).
    pub record_time: NaiveDateTime,
    /// Address of the device that produced the record.
    pub ip: String,
}

/// A live attendance punch delivered by a real-time event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealTimeEvent {
    pub user_id: String,
    pub att_time: NaiveDateTime,
}

/// Extract a NUL-terminated ASCII string from a fixed-width field.
pub fn extract_ascii(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

/// Decode a 72-byte user record (TCP format).
pub fn decode_user_72(data: &[u8]) -> User {
    User {
        uid: u16::from_le_bytes([data[0], data[1]]),
        role: data[2],
        password: extract_ascii(&data[3..11]),
        name: extract_ascii(&data[11..35]),
        card_no: u32::from_le_bytes([data[35], data[36], data[37], data[38]]),
        user_id: extract_ascii(&data[48..57]),
    }
}

/// Decode a 28-byte user record (UDP format).
pub fn decode_user_28(data: &[u8]) -> User {
    User {
        uid: u16::from_le_bytes([data[0], data[1]]),
        role: data[2],
        password: String::new(),
        name: extract_ascii(&data[8..16]),
        card_no: 0,
        user_id: u32::from_le_bytes([data[24], data[25], data[26], data[27]]).to_string(),
    }
}

/// Decode a 40-byte attendance record (TCP format).
pub fn decode_attendance_40(data: &[u8], ip: &str) -> AttendanceRecord {
    AttendanceRecord {
        user_sn: u16::from_le_bytes([data[0], data[1]]),
        device_user_id: extract_ascii(&data[2..11]),
        record_time: decode_compact(u32::from_le_bytes([data[27], data[28], data[29], data[30]])),
        ip: ip.to_string(),
    }
}

/// Decode a 16-byte attendance record (UDP format).
pub fn decode_attendance_16(data: &[u8], ip: &str) -> AttendanceRecord {
    AttendanceRecord {
        user_sn: 0,
        device_user_id: u16::from_le_bytes([data[0], data[1]]).to_string(),
        record_time: decode_compact(u32::from_le_bytes([data[4], data[5], data[6], data[7]])),
        ip: ip.to_string(),
    }
}

/// Decode a real-time event body from a TCP frame (prefix and header
/// already stripped). The full body is 52 bytes; only the leading 32 carry
/// the punch.
pub fn decode_event_tcp(body: &[u8]) -> Option<RealTimeEvent> {
    if body.len() < 32 {
        return None;
    }
    Some(RealTimeEvent {
        user_id: extract_ascii(&body[0..9]),
        att_time: decode_sextet(&body[26..32])?,
    })
}

/// Decode a real-time event from a full 18-byte UDP datagram (header
/// included).
pub fn decode_event_udp(frame: &[u8]) -> Option<RealTimeEvent> {
    if frame.len() < 18 {
        return None;
    }
    Some(RealTimeEvent {
        user_id: frame[8].to_string(),
        att_time: decode_sextet(&frame[12..18])?,
    })
}

/// Encode the 72-byte USER_WRQ payload for writing a user to the device.
pub fn encode_user_72(
    uid: u16,
    user_id: &str,
    name: &str,
    password: &str,
    role: u8,
    card_no: u32,
) -> [u8; USER_RECORD_TCP] {
    let mut buf = [0u8; USER_RECORD_TCP];
    buf[0..2].copy_from_slice(&uid.to_le_bytes());
    buf[2] = role;
    write_ascii(&mut buf[3..11], password);
    write_ascii(&mut buf[11..35], name);
    buf[35..39].copy_from_slice(&card_no.to_le_bytes());
    write_ascii(&mut buf[48..57], user_id);
    buf
}

fn write_ascii(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Walk a bulk-read user buffer: skip the 4-byte count prefix, then decode
/// fixed-width records until fewer than `record_size` bytes remain.
pub fn parse_users(data: &[u8], record_size: usize) -> Vec<User> {
    if data.len() < 4 {
        return Vec::new();
    }
    data[4..]
        .chunks_exact(record_size)
        .map(|chunk| match record_size {
            USER_RECORD_TCP => decode_user_72(chunk),
            _ => decode_user_28(chunk),
        })
        .collect()
}

/// Walk a bulk-read attendance buffer, annotating each record with the
/// device address.
pub fn parse_attendances(data: &[u8], record_size: usize, ip: &str) -> Vec<AttendanceRecord> {
    if data.len() < 4 {
        return Vec::new();
    }
    data[4..]
        .chunks_exact(record_size)
        .map(|chunk| match record_size {
            ATT_RECORD_TCP => decode_attendance_40(chunk, ip),
            _ => decode_attendance_16(chunk, ip),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::time::encode_compact;
    use chrono::NaiveDate;

    #[test]
    fn test_extract_ascii_trims_at_nul() {
        assert_eq!(extract_ascii(b"Alice\0\0\0"), "Alice");
        assert_eq!(extract_ascii(b"NoTerminator"), "NoTerminator");
        assert_eq!(extract_ascii(b"\0garbage"), "");
    }

    #[test]
    fn test_user_72_round_trip() {
        let buf = encode_user_72(42, "1001", "Alice", "secret", 0, 0xDEADBEEF);
        let user = decode_user_72(&buf);

        assert_eq!(user.uid, 42);
        assert_eq!(user.user_id, "1001");
        assert_eq!(user.name, "Alice");
        assert_eq!(user.password, "secret");
        assert_eq!(user.role, 0);
        assert_eq!(user.card_no, 0xDEADBEEF);
    }

    #[test]
    fn test_user_72_truncates_long_fields() {
        let buf = encode_user_72(1, "123456789", "a name that is far longer than the field", "pw", 14, 0);
        let user = decode_user_72(&buf);
        assert_eq!(user.user_id, "123456789");
        assert_eq!(user.name.len(), 24);
        assert_eq!(user.role, 14);
    }

    #[test]
    fn test_decode_user_28() {
        let mut buf = [0u8; USER_RECORD_UDP];
        buf[0..2].copy_from_slice(&7u16.to_le_bytes());
        buf[2] = 14;
        buf[8..11].copy_from_slice(b"Bob");
        buf[24..28].copy_from_slice(&2001u32.to_le_bytes());

        let user = decode_user_28(&buf);
        assert_eq!(user.uid, 7);
        assert_eq!(user.role, 14);
        assert_eq!(user.name, "Bob");
        assert_eq!(user.user_id, "2001");
    }

    #[test]
    fn test_decode_attendance_40() {
        let punch = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(7, 45, 10)
            .unwrap();

        let mut buf = [0u8; ATT_RECORD_TCP];
        buf[0..2].copy_from_slice(&9u16.to_le_bytes());
        buf[2..6].copy_from_slice(b"1001");
        buf[27..31].copy_from_slice(&encode_compact(&punch).to_le_bytes());

        let record = decode_attendance_40(&buf, "192.168.1.201");
        assert_eq!(record.user_sn, 9);
        assert_eq!(record.device_user_id, "1001");
        assert_eq!(record.record_time, punch);
        assert_eq!(record.ip, "192.168.1.201");
    }

    #[test]
    fn test_decode_attendance_16() {
        let punch = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(17, 0, 0)
            .unwrap();

        let mut buf = [0u8; ATT_RECORD_UDP];
        buf[0..2].copy_from_slice(&65u16.to_le_bytes());
        buf[4..8].copy_from_slice(&encode_compact(&punch).to_le_bytes());

        let record = decode_attendance_16(&buf, "10.0.0.2");
        assert_eq!(record.device_user_id, "65");
        assert_eq!(record.record_time, punch);
    }

    #[test]
    fn test_parse_users_skips_count_prefix() {
        let mut data = vec![0u8; 4 + 2 * USER_RECORD_TCP];
        data[0..4].copy_from_slice(&(2u32).to_le_bytes());
        data[4..4 + USER_RECORD_TCP].copy_from_slice(&encode_user_72(1, "10", "A", "", 0, 0));
        data[4 + USER_RECORD_TCP..].copy_from_slice(&encode_user_72(2, "20", "B", "", 0, 0));

        let users = parse_users(&data, USER_RECORD_TCP);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].uid, 1);
        assert_eq!(users[1].user_id, "20");
    }

    #[test]
    fn test_parse_users_ignores_trailing_partial() {
        let mut data = vec![0u8; 4 + USER_RECORD_UDP + 5];
        data[4..6].copy_from_slice(&3u16.to_le_bytes());

        let users = parse_users(&data, USER_RECORD_UDP);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, 3);
    }

    #[test]
    fn test_parse_empty_buffers() {
        assert!(parse_users(&[], USER_RECORD_TCP).is_empty());
        assert!(parse_attendances(&[0, 0, 0], ATT_RECORD_TCP, "x").is_empty());
    }

    #[test]
    fn test_decode_event_tcp() {
        let mut body = vec![0u8; 52];
        body[0..4].copy_from_slice(b"1001");
        body[26..32].copy_from_slice(&[24, 12, 31, 23, 59, 58]);

        let event = decode_event_tcp(&body).unwrap();
        assert_eq!(event.user_id, "1001");
        assert_eq!(
            event.att_time,
            NaiveDate::from_ymd_opt(2024, 12, 31)
                .unwrap()
                .and_hms_opt(23, 59, 58)
                .unwrap()
        );
    }

    #[test]
    fn test_decode_event_udp() {
        let mut frame = vec![0u8; 18];
        frame[8] = 65;
        frame[12..18].copy_from_slice(&[23, 1, 2, 3, 4, 5]);

        let event = decode_event_udp(&frame).unwrap();
        assert_eq!(event.user_id, "65");
        assert_eq!(
            event.att_time,
            NaiveDate::from_ymd_opt(2023, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap()
        );
    }

    #[test]
    fn test_decode_event_too_short() {
        assert!(decode_event_tcp(&[0u8; 10]).is_none());
        assert!(decode_event_udp(&[0u8; 12]).is_none());
    }
}
