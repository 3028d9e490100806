//! UDP transport: datagram I/O and bulk-transfer reassembly.
//!
//! Used as the fallback when the device refuses TCP. Each reply is a whole
//! inner frame in a single datagram, so there is no stream framing to peel.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{BulkData, ProgressFn, RealTimeCallback, CONNECT_TIMEOUT, UDP_CHUNK_IDLE};
use crate::error::{Result, TimeoutKind, ZkError};
use crate::protocol::commands::{
    command_name, request_data, CMD_ACK_OK, CMD_CONNECT, CMD_DATA, CMD_DATA_RDY, CMD_DATA_WRRQ,
    CMD_EXIT, CMD_PREPARE_DATA, CMD_REG_EVENT, MAX_CHUNK,
};
use crate::protocol::frame;
use crate::protocol::records::{decode_event_udp, RealTimeEvent};

/// Largest datagram the device can send.
const RECV_BUFFER_SIZE: usize = 65_536;

/// UDP session with a ZK device.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    session_id: Option<u16>,
    reply_id: u16,
    timeout: Duration,
    ip: String,
    port: u16,
    inport: u16,
    realtime_cb: Option<RealTimeCallback>,
}

impl UdpTransport {
    pub fn new(ip: &str, port: u16, timeout_ms: u64, inport: u16) -> Self {
        Self {
            socket: None,
            session_id: None,
            reply_id: 0,
            timeout: Duration::from_millis(timeout_ms),
            ip: ip.to_string(),
            port,
            inport,
            realtime_cb: None,
        }
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn session_id(&self) -> Option<u16> {
        self.session_id
    }

    /// Bind the local port, aim the socket at the device, and run the
    /// CONNECT handshake.
    ///
    /// A local bind collision surfaces as `ZkError::AddrInUse`, which the
    /// client treats as a non-fatal condition for the UDP path.
    pub async fn connect(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.inport)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ZkError::AddrInUse(format!("local UDP port {}", self.inport))
            } else {
                ZkError::Io(e)
            }
        })?;
        socket.connect((self.ip.as_str(), self.port)).await?;

        debug!(
            "UDP socket bound to {:?}, device {}:{}",
            socket.local_addr().ok(),
            self.ip,
            self.port
        );
        self.socket = Some(socket);

        self.execute_cmd(CMD_CONNECT, &[]).await?;
        info!(
            "connected to {}:{} over UDP, session_id={:#06x}",
            self.ip,
            self.port,
            self.session_id.unwrap_or(0)
        );
        Ok(())
    }

    /// Execute a single command and await exactly one reply datagram.
    pub async fn execute_cmd(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>> {
        if command == CMD_CONNECT {
            self.session_id = Some(0);
            self.reply_id = 0;
        } else {
            self.reply_id = self.reply_id.wrapping_add(1);
        }

        let session = self.session_id.unwrap_or(0);
        let buf = frame::build_udp_frame(command, session, self.reply_id, data);
        let dur = if command == CMD_CONNECT || command == CMD_EXIT {
            CONNECT_TIMEOUT
        } else {
            self.timeout
        };

        let socket = self.socket.as_ref().ok_or_else(no_socket)?;
        timeout(dur, socket.send(&buf))
            .await
            .map_err(|_| ZkError::Timeout(TimeoutKind::OnWritingMessage))?
            .map_err(ZkError::Io)?;

        let mut recv = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let n = timeout(dur, socket.recv(&mut recv))
                .await
                .map_err(|_| ZkError::Timeout(TimeoutKind::OnReceivingRequestData))?
                .map_err(ZkError::Io)?;
            let datagram = &recv[..n];

            if frame::is_event_frame_udp(datagram) {
                dispatch_event(&mut self.realtime_cb, datagram);
                continue;
            }

            if command == CMD_CONNECT {
                let header = frame::parse_udp_header(datagram)?;
                self.session_id = Some(header.session_id);
            }
            return Ok(datagram.to_vec());
        }
    }

    /// Issue a DATA_WRRQ and collect the response, chunked or inline.
    pub async fn read_with_buffer(
        &mut self,
        request: &[u8],
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<BulkData> {
        self.reply_id = self.reply_id.wrapping_add(1);
        let session = self.session_id.unwrap_or(0);
        let buf = frame::build_udp_frame(CMD_DATA_WRRQ, session, self.reply_id, request);
        let dur = self.timeout;

        let socket = self.socket.as_ref().ok_or_else(no_socket)?;
        timeout(dur, socket.send(&buf))
            .await
            .map_err(|_| ZkError::Timeout(TimeoutKind::OnWritingMessage))?
            .map_err(ZkError::Io)?;

        let mut recv = vec![0u8; RECV_BUFFER_SIZE];
        let first = loop {
            let n = timeout(dur, socket.recv(&mut recv))
                .await
                .map_err(|_| {
                    ZkError::Timeout(TimeoutKind::InReceivingResponseAfterRequestingData)
                })?
                .map_err(ZkError::Io)?;
            let datagram = &recv[..n];
            if frame::is_event_frame_udp(datagram) {
                dispatch_event(&mut self.realtime_cb, datagram);
                continue;
            }
            break datagram.to_vec();
        };

        let header = frame::parse_udp_header(&first)?;
        match header.command {
            CMD_DATA => Ok(BulkData {
                data: first[8..].to_vec(),
                inline: true,
                err: None,
            }),
            CMD_ACK_OK | CMD_PREPARE_DATA => {
                if first.len() < 13 {
                    return Err(ZkError::InvalidResponse(format!(
                        "data announcement too short: {} bytes",
                        first.len()
                    )));
                }
                let size =
                    u32::from_le_bytes([first[9], first[10], first[11], first[12]]) as usize;
                self.receive_chunks(size, &mut progress).await
            }
            other => Err(ZkError::UnhandledCommand(command_name(other).to_string())),
        }
    }

    /// Chunked receive over datagrams: request every chunk, accumulate DATA
    /// frames, and resolve on the device's closing ACK_OK once the byte
    /// count matches the announcement. Lost datagrams never resolve early;
    /// the idle timer surfaces them with the partial buffer.
    async fn receive_chunks(
        &mut self,
        size: usize,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<BulkData> {
        let chunks = size / MAX_CHUNK;
        let remain = size % MAX_CHUNK;

        debug!(
            "bulk read: {size} bytes in {} chunks",
            chunks + usize::from(remain > 0)
        );

        for i in 0..chunks {
            self.send_chunk_request((i * MAX_CHUNK) as u32, MAX_CHUNK as u32).await;
        }
        // The trailing request is always sent, zero-sized when the total
        // divides evenly; the device tolerates it.
        self.send_chunk_request((chunks * MAX_CHUNK) as u32, remain as u32).await;

        let socket = self.socket.as_ref().ok_or_else(no_socket)?;
        let mut total: Vec<u8> = Vec::with_capacity(size);
        let mut recv = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let n = match timeout(UDP_CHUNK_IDLE, socket.recv(&mut recv)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ZkError::Io(e)),
                Err(_) => {
                    warn!("bulk read idle timeout with {}/{size} bytes", total.len());
                    return Ok(BulkData {
                        data: total,
                        inline: false,
                        err: Some(ZkError::Timeout(TimeoutKind::WhenReceivingPacket)),
                    });
                }
            };
            let datagram = &recv[..n];

            if frame::is_event_frame_udp(datagram) {
                dispatch_event(&mut self.realtime_cb, datagram);
                continue;
            }
            if datagram.len() < frame::HEADER_SIZE {
                debug!("ignoring runt datagram of {n} bytes");
                continue;
            }

            match u16::from_le_bytes([datagram[0], datagram[1]]) {
                CMD_DATA => {
                    total.extend_from_slice(&datagram[8..]);
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(total.len(), size);
                    }
                }
                CMD_ACK_OK if total.len() == size => {
                    debug!("bulk read complete, {size} bytes");
                    return Ok(BulkData {
                        data: total,
                        inline: false,
                        err: None,
                    });
                }
                CMD_ACK_OK => {
                    debug!(
                        "ACK_OK before all bytes arrived ({}/{size}), still waiting",
                        total.len()
                    );
                }
                other => {
                    debug!("ignoring {} during bulk read", command_name(other));
                }
            }
        }
    }

    /// Fire-and-forget DATA_RDY for one chunk. Send errors are logged, not
    /// raised; a lost request surfaces as the reassembly idle timeout.
    async fn send_chunk_request(&mut self, start: u32, size: u32) {
        self.reply_id = self.reply_id.wrapping_add(1);
        let session = self.session_id.unwrap_or(0);

        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&start.to_le_bytes());
        body[4..8].copy_from_slice(&size.to_le_bytes());
        let buf = frame::build_udp_frame(CMD_DATA_RDY, session, self.reply_id, &body);

        let Some(socket) = self.socket.as_ref() else {
            error!("chunk request at {start} with no socket");
            return;
        };
        if let Err(e) = socket.send(&buf).await {
            error!("failed to send chunk request at {start}: {e}");
        }
    }

    /// Enable real-time event delivery and install the callback.
    pub async fn subscribe_real_time(&mut self, callback: RealTimeCallback) -> Result<()> {
        let reply = self
            .execute_cmd(CMD_REG_EVENT, request_data::GET_REAL_TIME_EVENT)
            .await?;
        let header = frame::parse_udp_header(&reply)?;
        if header.command != CMD_ACK_OK {
            return Err(ZkError::UnhandledCommand(command_name(header.command).to_string()));
        }

        self.realtime_cb = Some(callback);
        info!("real-time events enabled for {}", self.ip);
        Ok(())
    }

    /// Block until the next event datagram arrives. Non-event datagrams
    /// read while idle-listening are discarded.
    pub async fn next_event(&mut self) -> Result<RealTimeEvent> {
        let mut recv = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let datagram = {
                let socket = self.socket.as_ref().ok_or_else(no_socket)?;
                let n = socket.recv(&mut recv).await.map_err(ZkError::Io)?;
                &recv[..n]
            };
            if !frame::is_event_frame_udp(datagram) {
                debug!("discarding non-event datagram while listening");
                continue;
            }
            dispatch_event(&mut self.realtime_cb, datagram);
            if let Some(event) = decode_event_udp(datagram) {
                return Ok(event);
            }
        }
    }

    /// Best-effort EXIT, then drop the socket.
    pub async fn disconnect(&mut self) -> Result<bool> {
        if self.socket.is_some() {
            if let Err(e) = self.execute_cmd(CMD_EXIT, &[]).await {
                debug!("EXIT on disconnect failed: {e}");
            }
        }
        self.socket = None;
        Ok(true)
    }

    pub fn socket_status(&self) -> String {
        match self.socket.as_ref().and_then(|s| s.local_addr().ok()) {
            Some(addr) => format!("Bound to port {}", addr.port()),
            None => "Unbound".to_string(),
        }
    }
}

fn no_socket() -> ZkError {
    ZkError::ConnectionRefused("no socket instance".to_string())
}

fn dispatch_event(callback: &mut Option<RealTimeCallback>, datagram: &[u8]) {
    match decode_event_udp(datagram) {
        Some(event) => {
            debug!("real-time punch: user {} at {}", event.user_id, event.att_time);
            if let Some(cb) = callback {
                cb(event);
            }
        }
        None => warn!("event datagram too short to decode ({} bytes)", datagram.len()),
    }
}
