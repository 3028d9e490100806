//! Session and transport tests against mock devices on loopback sockets.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::{TcpTransport, UdpTransport};
use crate::client::{ConnectionType, ZkClient};
use crate::error::{TimeoutKind, ZkError};
use crate::protocol::commands::{
    request_data, CMD_ACK_OK, CMD_CONNECT, CMD_DATA, CMD_DATA_RDY, CMD_DATA_WRRQ, CMD_EXIT,
    CMD_GET_FREE_SIZES, CMD_GET_TIME, CMD_PREPARE_DATA, CMD_REG_EVENT, EF_ATTLOG, MAX_CHUNK,
};
use crate::protocol::frame::{build_tcp_frame, build_udp_frame, parse_udp_header, TCP_PREFIX};
use crate::protocol::records::RealTimeEvent;
use crate::protocol::time::encode_compact;

/// Read one client frame on the mock-device side, returning the inner
/// frame (8-byte header + body).
async fn mock_read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut front = [0u8; 8];
    stream.read_exact(&mut front).await.unwrap();
    assert_eq!(&front[0..4], &TCP_PREFIX);
    let len = u32::from_le_bytes([front[4], front[5], front[6], front[7]]) as usize;
    let mut inner = vec![0u8; len];
    stream.read_exact(&mut inner).await.unwrap();
    inner
}

/// Announcement payload for a chunked transfer: total size at offset 1.
fn announce_payload(total: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 5];
    payload[1..5].copy_from_slice(&total.to_le_bytes());
    payload
}

#[tokio::test]
async fn test_tcp_connect_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let inner = mock_read_frame(&mut stream).await;
        let header = parse_udp_header(&inner).unwrap();
        assert_eq!(header.command, CMD_CONNECT);
        // Device hands out the session id in its reply header
        let reply = build_tcp_frame(CMD_ACK_OK, 0x55AA, 0, &[]);
        stream.write_all(&reply).await.unwrap();
        stream
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    transport.connect().await.unwrap();

    assert_eq!(transport.session_id(), Some(0x55AA));
    assert_eq!(transport.reply_id(), 0);
    assert_eq!(transport.socket_status(), "Open");

    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_reply_id_discipline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..4 {
            let _ = mock_read_frame(&mut stream).await;
            let reply = build_tcp_frame(CMD_ACK_OK, 7, 0, &[0u8; 80]);
            stream.write_all(&reply).await.unwrap();
        }
        stream
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    transport.connect().await.unwrap();
    assert_eq!(transport.reply_id(), 0);

    transport.execute_cmd(CMD_GET_FREE_SIZES, &[]).await.unwrap();
    assert_eq!(transport.reply_id(), 1);

    transport.execute_cmd(CMD_GET_TIME, &[]).await.unwrap();
    assert_eq!(transport.reply_id(), 2);

    // CONNECT resets the counter
    transport.execute_cmd(CMD_CONNECT, &[]).await.unwrap();
    assert_eq!(transport.reply_id(), 0);
    assert_eq!(transport.session_id(), Some(7));

    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_chunked_bulk_read() {
    const N: usize = 2 * MAX_CHUNK;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = mock_read_frame(&mut stream).await;
        stream.write_all(&build_tcp_frame(CMD_ACK_OK, 1, 0, &[])).await.unwrap();

        let inner = mock_read_frame(&mut stream).await;
        assert_eq!(parse_udp_header(&inner).unwrap().command, CMD_DATA_WRRQ);
        stream
            .write_all(&build_tcp_frame(CMD_PREPARE_DATA, 1, 0, &announce_payload(N as u32)))
            .await
            .unwrap();

        // Two full chunk requests plus the zero-sized trailer
        for expected_size in [MAX_CHUNK as u32, MAX_CHUNK as u32, 0u32] {
            let req = mock_read_frame(&mut stream).await;
            assert_eq!(parse_udp_header(&req).unwrap().command, CMD_DATA_RDY);
            let size = u32::from_le_bytes([req[12], req[13], req[14], req[15]]);
            assert_eq!(size, expected_size);
        }

        // Each chunk: 8-byte announcement body, then the chunk bytes
        for i in 0..2u8 {
            stream
                .write_all(&build_tcp_frame(CMD_PREPARE_DATA, 1, 0, &[0u8; 8]))
                .await
                .unwrap();
            let chunk = vec![0xA0 | i; MAX_CHUNK];
            stream.write_all(&build_tcp_frame(CMD_DATA, 1, 0, &chunk)).await.unwrap();
        }
        stream
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    transport.connect().await.unwrap();

    let mut calls: Vec<(usize, usize)> = Vec::new();
    let bulk = transport
        .read_with_buffer(
            request_data::GET_ATTENDANCE_LOGS,
            Some(&mut |received, total| calls.push((received, total))),
        )
        .await
        .unwrap();

    assert!(bulk.err.is_none());
    assert!(!bulk.inline);
    assert_eq!(bulk.data.len(), N);
    assert!(bulk.data[..MAX_CHUNK].iter().all(|&b| b == 0xA0));
    assert!(bulk.data[MAX_CHUNK..].iter().all(|&b| b == 0xA1));

    // Progress fires once per chunk with a non-decreasing count ending at N
    assert_eq!(calls, vec![(MAX_CHUNK, N), (N, N)]);

    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_inline_data_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = mock_read_frame(&mut stream).await;
        stream.write_all(&build_tcp_frame(CMD_ACK_OK, 3, 0, &[])).await.unwrap();

        let _ = mock_read_frame(&mut stream).await;
        stream
            .write_all(&build_tcp_frame(CMD_DATA, 3, 0, &[0x11; 12]))
            .await
            .unwrap();
        stream
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    transport.connect().await.unwrap();

    let bulk = transport.read_with_buffer(request_data::GET_USERS, None).await.unwrap();
    assert!(bulk.inline);
    assert_eq!(bulk.data, vec![0x11; 12]);

    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_event_demux_during_bulk_read() {
    const N: usize = 64;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = mock_read_frame(&mut stream).await;
        stream.write_all(&build_tcp_frame(CMD_ACK_OK, 2, 0, &[])).await.unwrap();

        // REG_EVENT registration
        let reg = mock_read_frame(&mut stream).await;
        assert_eq!(parse_udp_header(&reg).unwrap().command, CMD_REG_EVENT);
        assert_eq!(&reg[8..], &[0x01, 0x00, 0x00, 0x00]);
        stream.write_all(&build_tcp_frame(CMD_ACK_OK, 2, 0, &[])).await.unwrap();

        // DATA_WRRQ, then one remain-sized chunk request
        let _ = mock_read_frame(&mut stream).await;
        stream
            .write_all(&build_tcp_frame(CMD_ACK_OK, 2, 0, &announce_payload(N as u32)))
            .await
            .unwrap();
        let _ = mock_read_frame(&mut stream).await;

        // A punch happens mid-transfer: event frame interleaved with the
        // chunk. The event kind rides in the session-id slot.
        let mut event_body = vec![0u8; 52];
        event_body[0..4].copy_from_slice(b"1001");
        event_body[26..32].copy_from_slice(&[24, 5, 20, 8, 30, 0]);
        stream
            .write_all(&build_tcp_frame(CMD_REG_EVENT, EF_ATTLOG, 0, &event_body))
            .await
            .unwrap();

        stream
            .write_all(&build_tcp_frame(CMD_PREPARE_DATA, 2, 0, &[0u8; 8]))
            .await
            .unwrap();
        stream
            .write_all(&build_tcp_frame(CMD_DATA, 2, 0, &[0x5A; N]))
            .await
            .unwrap();
        stream
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    transport.connect().await.unwrap();

    let events: Arc<Mutex<Vec<RealTimeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    transport
        .subscribe_real_time(Box::new(move |event| sink.lock().unwrap().push(event)))
        .await
        .unwrap();

    let bulk = transport.read_with_buffer(request_data::GET_USERS, None).await.unwrap();

    // The event bytes must not leak into the reassembled buffer
    assert!(bulk.err.is_none());
    assert_eq!(bulk.data, vec![0x5A; N]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].user_id, "1001");
    assert_eq!(
        events[0].att_time,
        NaiveDate::from_ymd_opt(2024, 5, 20).unwrap().and_hms_opt(8, 30, 0).unwrap()
    );

    let _ = server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_disconnect_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..2 {
            let _ = mock_read_frame(&mut stream).await;
            stream.write_all(&build_tcp_frame(CMD_ACK_OK, 9, 0, &[])).await.unwrap();
        }
    });

    let mut transport = TcpTransport::new("127.0.0.1", addr.port(), 2000);
    assert_eq!(transport.socket_status(), "No socket instance");

    transport.connect().await.unwrap();
    assert!(transport.disconnect().await.unwrap());
    assert_eq!(transport.socket_status(), "Closed");

    server.await.unwrap();
}

#[tokio::test]
async fn test_udp_connect_and_execute() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_port = device.local_addr().unwrap().port();

    let clock = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap().and_hms_opt(8, 30, 0).unwrap();
    let server = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];

        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_CONNECT);
        device
            .send_to(&build_udp_frame(CMD_ACK_OK, 0x55AA, 0, &[]), peer)
            .await
            .unwrap();

        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_GET_TIME);
        let packed = encode_compact(&clock).to_le_bytes();
        device
            .send_to(&build_udp_frame(CMD_ACK_OK, 0x55AA, 1, &packed), peer)
            .await
            .unwrap();
    });

    let mut transport = UdpTransport::new("127.0.0.1", device_port, 2000, 0);
    transport.connect().await.unwrap();
    assert_eq!(transport.session_id(), Some(0x55AA));
    assert!(transport.socket_status().starts_with("Bound to port "));

    let reply = transport.execute_cmd(CMD_GET_TIME, &[]).await.unwrap();
    let packed = u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]);
    assert_eq!(crate::protocol::time::decode_compact(packed), clock);

    server.await.unwrap();
}

#[tokio::test]
async fn test_udp_bulk_read_resolves_only_on_matching_ack() {
    const N: usize = 32;

    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_port = device.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];

        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_CONNECT);
        device.send_to(&build_udp_frame(CMD_ACK_OK, 5, 0, &[]), peer).await.unwrap();

        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_DATA_WRRQ);
        device
            .send_to(&build_udp_frame(CMD_PREPARE_DATA, 5, 0, &announce_payload(N as u32)), peer)
            .await
            .unwrap();

        // One remain-sized chunk request
        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_DATA_RDY);

        // Half the data, a premature ACK_OK that must not resolve the
        // read, then the rest and the real ACK_OK.
        device
            .send_to(&build_udp_frame(CMD_DATA, 5, 0, &[0xC3; 16]), peer)
            .await
            .unwrap();
        device.send_to(&build_udp_frame(CMD_ACK_OK, 5, 0, &[]), peer).await.unwrap();
        device
            .send_to(&build_udp_frame(CMD_DATA, 5, 0, &[0xC4; 16]), peer)
            .await
            .unwrap();
        device.send_to(&build_udp_frame(CMD_ACK_OK, 5, 0, &[]), peer).await.unwrap();
    });

    let mut transport = UdpTransport::new("127.0.0.1", device_port, 2000, 0);
    transport.connect().await.unwrap();

    let mut calls: Vec<(usize, usize)> = Vec::new();
    let bulk = transport
        .read_with_buffer(
            request_data::GET_ATTENDANCE_LOGS,
            Some(&mut |received, total| calls.push((received, total))),
        )
        .await
        .unwrap();

    assert!(bulk.err.is_none());
    assert_eq!(bulk.data.len(), N);
    assert_eq!(calls, vec![(16, N), (N, N)]);

    server.await.unwrap();
}

#[tokio::test]
async fn test_udp_bulk_read_timeout_returns_partial() {
    const N: usize = 64;

    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_port = device.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];

        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(parse_udp_header(&buf[..n]).unwrap().command, CMD_CONNECT);
        device.send_to(&build_udp_frame(CMD_ACK_OK, 6, 0, &[]), peer).await.unwrap();

        let (_, peer) = device.recv_from(&mut buf).await.unwrap();
        device
            .send_to(&build_udp_frame(CMD_PREPARE_DATA, 6, 0, &announce_payload(N as u32)), peer)
            .await
            .unwrap();
        let _ = device.recv_from(&mut buf).await.unwrap();

        // Only a quarter of the announced bytes ever arrive
        device
            .send_to(&build_udp_frame(CMD_DATA, 6, 0, &[0x77; 16]), peer)
            .await
            .unwrap();
    });

    let mut transport = UdpTransport::new("127.0.0.1", device_port, 2000, 0);
    transport.connect().await.unwrap();

    let bulk = transport
        .read_with_buffer(request_data::GET_ATTENDANCE_LOGS, None)
        .await
        .unwrap();

    assert_eq!(bulk.data, vec![0x77; 16]);
    match bulk.err {
        Some(ZkError::Timeout(TimeoutKind::WhenReceivingPacket)) => {}
        other => panic!("expected chunk-idle timeout, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn test_client_falls_back_to_udp_on_refused_tcp() {
    // A freshly bound-and-dropped UDP port: the mock device listens there
    // on UDP while nothing listens on TCP, so the TCP attempt is refused.
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = device.local_addr().unwrap().port();

    let clock = NaiveDate::from_ymd_opt(2023, 11, 2).unwrap().and_hms_opt(17, 5, 30).unwrap();
    let server = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, peer) = device.recv_from(&mut buf).await.unwrap();
            let header = parse_udp_header(&buf[..n]).unwrap();
            match header.command {
                CMD_CONNECT => {
                    device.send_to(&build_udp_frame(CMD_ACK_OK, 0x0101, 0, &[]), peer).await.unwrap();
                }
                CMD_GET_TIME => {
                    let packed = encode_compact(&clock).to_le_bytes();
                    device.send_to(&build_udp_frame(CMD_ACK_OK, 0x0101, 1, &packed), peer).await.unwrap();
                }
                CMD_EXIT => {
                    device.send_to(&build_udp_frame(CMD_ACK_OK, 0x0101, 2, &[]), peer).await.unwrap();
                    break;
                }
                other => panic!("unexpected command {other}"),
            }
        }
    });

    let mut client = ZkClient::new("127.0.0.1", port, 2000, 0);
    client.connect().await.unwrap();
    assert_eq!(client.connection_type(), Some(ConnectionType::Udp));

    // Subsequent operations route to the UDP transport
    let time = client.get_time().await.unwrap();
    assert_eq!(time, clock);

    assert!(client.disconnect().await.unwrap());
    server.await.unwrap();
}
