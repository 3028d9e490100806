//! TCP transport: framed stream I/O, session state machine, chunked
//! bulk-transfer reassembly.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    BulkData, ProgressFn, RealTimeCallback, CONNECT_TIMEOUT, MAX_FRAME_SIZE, TCP_CHUNK_IDLE,
};
use crate::error::{Result, TimeoutKind, ZkError};
use crate::protocol::commands::{
    command_name, CMD_ACK_OK, CMD_CONNECT, CMD_DATA, CMD_DATA_RDY, CMD_DATA_WRRQ, CMD_EXIT,
    CMD_PREPARE_DATA, CMD_REG_EVENT, MAX_CHUNK,
};
use crate::protocol::frame;
use crate::protocol::records::{decode_event_tcp, RealTimeEvent};

/// TCP session with a ZK device.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    closed: bool,
    session_id: Option<u16>,
    reply_id: u16,
    timeout: Duration,
    ip: String,
    port: u16,
    realtime_cb: Option<RealTimeCallback>,
    realtime_registered: bool,
}

impl TcpTransport {
    pub fn new(ip: &str, port: u16, timeout_ms: u64) -> Self {
        Self {
            stream: None,
            closed: false,
            session_id: None,
            reply_id: 0,
            timeout: Duration::from_millis(timeout_ms),
            ip: ip.to_string(),
            port,
            realtime_cb: None,
            realtime_registered: false,
        }
    }

    pub fn has_socket(&self) -> bool {
        self.stream.is_some()
    }

    pub fn session_id(&self) -> Option<u16> {
        self.session_id
    }

    #[cfg(test)]
    pub(crate) fn reply_id(&self) -> u16 {
        self.reply_id
    }

    /// Open the stream and run the CONNECT handshake.
    ///
    /// A refused TCP connection surfaces as `ZkError::Io` with
    /// `ConnectionRefused`, which the client uses to fall back to UDP.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.ip, self.port);
        debug!("TCP connecting to {addr}");

        let stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ZkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("TCP connect timeout to {addr}"),
                ))
            })??;

        self.stream = Some(stream);
        self.closed = false;

        self.execute_cmd(CMD_CONNECT, &[]).await?;
        info!(
            "connected to {addr}, session_id={:#06x}",
            self.session_id.unwrap_or(0)
        );
        Ok(())
    }

    /// Execute a single command and await exactly one reply.
    ///
    /// CONNECT resets the session and reply counters; every other command
    /// advances the reply id by one. Event frames arriving while the reply
    /// is awaited are dispatched to the real-time callback and never
    /// returned here.
    pub async fn execute_cmd(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>> {
        if command == CMD_CONNECT {
            self.session_id = Some(0);
            self.reply_id = 0;
        } else {
            self.reply_id = self.reply_id.wrapping_add(1);
        }

        let session = self.session_id.unwrap_or(0);
        let buf = frame::build_tcp_frame(command, session, self.reply_id, data);
        let dur = if command == CMD_CONNECT || command == CMD_EXIT {
            CONNECT_TIMEOUT
        } else {
            self.timeout
        };

        {
            let stream = self.stream.as_mut().ok_or_else(no_socket)?;
            write_frame(stream, &buf, dur).await?;
        }

        loop {
            let stream = self.stream.as_mut().ok_or_else(no_socket)?;
            let inner =
                read_inner_frame_timed(stream, dur, TimeoutKind::OnReceivingRequestData).await?;

            if frame::is_event_frame_tcp(&inner) {
                dispatch_event(&mut self.realtime_cb, &inner);
                continue;
            }

            if command == CMD_CONNECT {
                let header = frame::parse_udp_header(&inner)?;
                self.session_id = Some(header.session_id);
            }
            return Ok(inner);
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
        let buf = frame::build_tcp_frame(CMD_DATA_WRRQ, session, self.reply_id, request);
        let dur = self.timeout;

        {
            let stream = self.stream.as_mut().ok_or_else(no_socket)?;
            write_frame(stream, &buf, dur).await?;
        }

        let first = loop {
            let stream = self.stream.as_mut().ok_or_else(no_socket)?;
            let inner = read_inner_frame_timed(
                stream,
                dur,
                TimeoutKind::InReceivingResponseAfterRequestingData,
            )
            .await?;
            if frame::is_event_frame_tcp(&inner) {
                dispatch_event(&mut self.realtime_cb, &inner);
                continue;
            }
            break inner;
        };

        let header = frame::parse_udp_header(&first)?;
        match header.command {
            CMD_DATA => Ok(BulkData {
                data: first[8..].to_vec(),
                inline: true,
                err: None,
            }),
            CMD_ACK_OK | CMD_PREPARE_DATA => {
                // Announced total byte count rides at payload offset 1
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

    /// Chunked receive: request every chunk, then reassemble the stream of
    /// announcement + data frames the device sends back.
    async fn receive_chunks(
        &mut self,
        size: usize,
        progress: &mut Option<ProgressFn<'_>>,
    ) -> Result<BulkData> {
        let chunks = size / MAX_CHUNK;
        let remain = size % MAX_CHUNK;
        let mut packets_remaining = chunks + usize::from(remain > 0);

        debug!("bulk read: {size} bytes in {packets_remaining} chunks");

        for i in 0..chunks {
            self.send_chunk_request((i * MAX_CHUNK) as u32, MAX_CHUNK as u32).await;
        }
        // The trailing request is always sent, zero-sized when the total
        // divides evenly; the device tolerates it.
        self.send_chunk_request((chunks * MAX_CHUNK) as u32, remain as u32).await;

        let mut reply: Vec<u8> = Vec::with_capacity(size);
        let mut assembled: Vec<u8> = Vec::new();

        while packets_remaining > 0 {
            let inner = {
                let stream = self.stream.as_mut().ok_or_else(no_socket)?;
                match read_inner_frame_timed(
                    stream,
                    TCP_CHUNK_IDLE,
                    TimeoutKind::WhenReceivingPacket,
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(e @ (ZkError::Timeout(_) | ZkError::SocketDisconnected)) => {
                        warn!(
                            "bulk read interrupted with {}/{size} bytes, {packets_remaining} chunks outstanding: {e}",
                            reply.len()
                        );
                        return Ok(BulkData {
                            data: reply,
                            inline: false,
                            err: Some(e),
                        });
                    }
                    Err(e) => return Err(e),
                }
            };

            if frame::is_event_frame_tcp(&inner) {
                dispatch_event(&mut self.realtime_cb, &inner);
                continue;
            }

            assembled.extend_from_slice(&inner[8..]);

            // A chunk arrives as an 8-byte announcement body followed by
            // data frames; complete once announcement + chunk bytes are in.
            let expected = if packets_remaining > 1 || remain == 0 {
                MAX_CHUNK + 8
            } else {
                remain + 8
            };
            if assembled.len() >= expected {
                reply.extend_from_slice(&assembled[8..]);
                assembled.clear();
                packets_remaining -= 1;
                if let Some(cb) = progress.as_deref_mut() {
                    cb(reply.len(), size);
                }
                debug!("chunk complete, {}/{size} bytes", reply.len());
            }
        }

        Ok(BulkData {
            data: reply,
            inline: false,
            err: None,
        })
    }

    /// Fire-and-forget DATA_RDY for one chunk. Send errors are logged, not
    /// raised; a lost request surfaces as the reassembly idle timeout.
    async fn send_chunk_request(&mut self, start: u32, size: u32) {
        self.reply_id = self.reply_id.wrapping_add(1);
        let session = self.session_id.unwrap_or(0);

        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&start.to_le_bytes());
        body[4..8].copy_from_slice(&size.to_le_bytes());
        let buf = frame::build_tcp_frame(CMD_DATA_RDY, session, self.reply_id, &body);

        let dur = self.timeout;
        let Some(stream) = self.stream.as_mut() else {
            error!("chunk request at {start} with no socket");
            return;
        };
        if let Err(e) = write_frame(stream, &buf, dur).await {
            error!("failed to send chunk request at {start}: {e}");
        }
    }

    /// Enable real-time event delivery and install the callback.
    ///
    /// Repeated calls replace the callback without re-registering on the
    /// wire.
    pub async fn subscribe_real_time(&mut self, callback: RealTimeCallback) -> Result<()> {
        if self.realtime_registered {
            self.realtime_cb = Some(callback);
            return Ok(());
        }

        // Long-lived sessions re-arm from a low reply id before the
        // registration exchange.
        if self.reply_id > 100 {
            self.reply_id = 0;
        }

        let reply = self.execute_cmd(CMD_REG_EVENT, &[0x01, 0x00, 0x00, 0x00]).await?;
        let header = frame::parse_udp_header(&reply)?;
        if header.command != CMD_ACK_OK {
            return Err(ZkError::UnhandledCommand(command_name(header.command).to_string()));
        }

        self.realtime_cb = Some(callback);
        self.realtime_registered = true;
        info!("real-time events enabled for {}", self.ip);
        Ok(())
    }

    /// Block until the next event frame arrives. Non-event frames read
    /// while idle-listening are discarded.
    pub async fn next_event(&mut self) -> Result<RealTimeEvent> {
        loop {
            let inner = {
                let stream = self.stream.as_mut().ok_or_else(no_socket)?;
                read_inner_frame(stream).await?
            };
            if !frame::is_event_frame_tcp(&inner) {
                debug!(
                    "discarding non-event frame ({}) while listening",
                    command_name(u16::from_le_bytes([inner[0], inner[1]]))
                );
                continue;
            }
            dispatch_event(&mut self.realtime_cb, &inner);
            if let Some(event) = decode_event_tcp(&inner[8..]) {
                return Ok(event);
            }
        }
    }

    /// Best-effort EXIT, then close the stream.
    pub async fn disconnect(&mut self) -> Result<bool> {
        if self.stream.is_some() {
            if let Err(e) = self.execute_cmd(CMD_EXIT, &[]).await {
                debug!("EXIT on disconnect failed: {e}");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.closed = true;
        self.realtime_registered = false;
        Ok(true)
    }

    pub fn socket_status(&self) -> String {
        if self.stream.is_some() {
            "Open".to_string()
        } else if self.closed {
            "Closed".to_string()
        } else {
            "No socket instance".to_string()
        }
    }
}

fn no_socket() -> ZkError {
    ZkError::ConnectionRefused("no socket instance".to_string())
}

/// Map stream-level read failures: a peer close mid-conversation is the
/// protocol-level disconnect error, everything else stays an IO error.
fn map_read_err(e: std::io::Error) -> ZkError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => ZkError::SocketDisconnected,
        _ => ZkError::Io(e),
    }
}

async fn write_frame(stream: &mut TcpStream, buf: &[u8], dur: Duration) -> Result<()> {
    timeout(dur, stream.write_all(buf))
        .await
        .map_err(|_| ZkError::Timeout(TimeoutKind::OnWritingMessage))?
        .map_err(ZkError::Io)
}

/// Read one prefixed frame off the stream and return the inner frame
/// (8-byte header + body).
async fn read_inner_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut front = [0u8; 8];
    stream.read_exact(&mut front).await.map_err(map_read_err)?;

    if front[0..4] != frame::TCP_PREFIX {
        return Err(ZkError::InvalidResponse(format!(
            "bad TCP prefix: {:02X?}",
            &front[0..4]
        )));
    }

    let payload_size = u32::from_le_bytes([front[4], front[5], front[6], front[7]]) as usize;
    if payload_size < frame::HEADER_SIZE || payload_size > MAX_FRAME_SIZE {
        return Err(ZkError::InvalidResponse(format!(
            "implausible frame length: {payload_size}"
        )));
    }

    let mut inner = vec![0u8; payload_size];
    stream.read_exact(&mut inner).await.map_err(map_read_err)?;
    Ok(inner)
}

async fn read_inner_frame_timed(
    stream: &mut TcpStream,
    dur: Duration,
    kind: TimeoutKind,
) -> Result<Vec<u8>> {
    timeout(dur, read_inner_frame(stream))
        .await
        .map_err(|_| ZkError::Timeout(kind))?
}

fn dispatch_event(callback: &mut Option<RealTimeCallback>, inner: &[u8]) {
    match decode_event_tcp(&inner[8..]) {
        Some(event) => {
            debug!("real-time punch: user {} at {}", event.user_id, event.att_time);
            if let Some(cb) = callback {
                cb(event);
            }
        }
        None => warn!("event frame too short to decode ({} bytes)", inner.len()),
    }
}
