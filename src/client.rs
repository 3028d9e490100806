//! Client façade: transport selection, fallback, and device operations.

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::error::{Result, ZkError};
use crate::protocol::commands::{
    command_name, request_data, CMD_ACK_OK, CMD_CLEAR_ATTLOG, CMD_DISABLEDEVICE, CMD_ENABLEDEVICE,
    CMD_GET_FREE_SIZES, CMD_GET_TIME, CMD_GET_VERSION, CMD_OPTIONS_RRQ, CMD_USER_WRQ,
};
use crate::protocol::frame::parse_udp_header;
use crate::protocol::records::{
    self, encode_user_72, AttendanceRecord, RealTimeEvent, User, ATT_RECORD_TCP, ATT_RECORD_UDP,
    USER_RECORD_TCP, USER_RECORD_UDP,
};
use crate::protocol::time::decode_compact;
use crate::transport::{ProgressFn, RealTimeCallback, TcpTransport, Transport, UdpTransport};

/// Which transport a connected client ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Tcp,
    Udp,
}

/// Device storage counters reported by GET_FREE_SIZES.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Users currently enrolled.
    pub user_counts: u32,
    /// Attendance records currently stored.
    pub log_counts: u32,
    /// Attendance record capacity.
    pub log_capacity: u32,
}

/// Client for a single ZKTeco device.
///
/// Connects over TCP first and falls back to UDP when the device refuses
/// the TCP connection. One client owns one session; issue one command at a
/// time.
pub struct ZkClient {
    ip: String,
    port: u16,
    timeout_ms: u64,
    inport: u16,
    transport: Option<Transport>,
}

impl ZkClient {
    /// Create a client for `ip:port` with a per-command timeout in
    /// milliseconds and a local UDP bind port for the fallback path.
    pub fn new(ip: &str, port: u16, timeout_ms: u64, inport: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            timeout_ms,
            inport,
            transport: None,
        }
    }

    /// Build a client from file-backed settings.
    pub fn from_config(config: &crate::config::DeviceConfig) -> Self {
        Self::new(&config.ip, config.port, config.timeout_ms, config.inport)
    }

    /// The transport currently in use, once connected.
    pub fn connection_type(&self) -> Option<ConnectionType> {
        self.transport.as_ref().map(|t| match t {
            Transport::Tcp(_) => ConnectionType::Tcp,
            Transport::Udp(_) => ConnectionType::Udp,
        })
    }

    /// Connect to the device: TCP first, UDP on connection refusal.
    ///
    /// A local UDP bind collision still counts as UDP-connected — a prior
    /// socket on that port means the device side is already reachable, and
    /// the error is reported on the first real operation instead.
    pub async fn connect(&mut self) -> Result<()> {
        let mut tcp = TcpTransport::new(&self.ip, self.port, self.timeout_ms);
        match tcp.connect().await {
            Ok(()) => {
                self.transport = Some(Transport::Tcp(tcp));
                return Ok(());
            }
            Err(e) if e.is_refused() => {
                info!("TCP refused by {}, falling back to UDP", self.ip);
            }
            Err(e) => return Err(e.in_context(&self.ip, "CMD_CONNECT")),
        }

        let mut udp = UdpTransport::new(&self.ip, self.port, self.timeout_ms, self.inport);
        match udp.connect().await {
            Ok(()) => {
                self.transport = Some(Transport::Udp(udp));
                Ok(())
            }
            Err(ZkError::AddrInUse(msg)) => {
                warn!("UDP bind collision ({msg}), keeping UDP client without a socket");
                self.transport = Some(Transport::Udp(udp));
                Ok(())
            }
            Err(e) => {
                let _ = udp.disconnect().await;
                Err(e.in_context(&self.ip, "CMD_CONNECT"))
            }
        }
    }

    /// Best-effort EXIT and socket teardown. Errors from EXIT are
    /// swallowed; returns true once the socket is closed.
    pub async fn disconnect(&mut self) -> Result<bool> {
        match self.transport.as_mut() {
            Some(t) => t.disconnect().await.map_err(|e| e.in_context(&self.ip, "CMD_EXIT")),
            None => Ok(true),
        }
    }

    /// Human-readable socket state, mainly for diagnostics.
    pub fn socket_status(&self) -> String {
        match self.transport.as_ref() {
            Some(t) => t.socket_status(),
            None => "No socket instance".to_string(),
        }
    }

    /// Execute a raw command on the active transport and return the inner
    /// reply frame (8-byte header + body).
    pub async fn execute_cmd(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>> {
        let ip = self.ip.clone();
        let transport = self.active_transport()?;
        transport
            .execute_cmd(command, data)
            .await
            .map_err(|e| e.in_context(&ip, command_name(command)))
    }

    /// Read user and log counters from the device.
    pub async fn get_info(&mut self) -> Result<DeviceInfo> {
        let reply = self.execute_cmd(CMD_GET_FREE_SIZES, &[]).await?;
        if reply.len() < 76 {
            return Err(ZkError::InvalidResponse(format!(
                "free sizes reply too short: {} bytes",
                reply.len()
            ))
            .in_context(&self.ip, "CMD_GET_FREE_SIZES"));
        }
        Ok(DeviceInfo {
            user_counts: read_u32(&reply, 24),
            log_counts: read_u32(&reply, 40),
            log_capacity: read_u32(&reply, 72),
        })
    }

    /// Number of attendance records currently stored on the device.
    pub async fn get_attendance_size(&mut self) -> Result<u32> {
        let reply = self.execute_cmd(CMD_GET_FREE_SIZES, &[]).await?;
        if reply.len() < 44 {
            return Err(ZkError::InvalidResponse(format!(
                "free sizes reply too short: {} bytes",
                reply.len()
            ))
            .in_context(&self.ip, "CMD_GET_FREE_SIZES"));
        }
        Ok(read_u32(&reply, 40))
    }

    /// Read the device wall clock.
    pub async fn get_time(&mut self) -> Result<NaiveDateTime> {
        let reply = self.execute_cmd(CMD_GET_TIME, &[]).await?;
        if reply.len() < 12 {
            return Err(ZkError::InvalidResponse(format!(
                "time reply too short: {} bytes",
                reply.len()
            ))
            .in_context(&self.ip, "CMD_GET_TIME"));
        }
        Ok(decode_compact(read_u32(&reply, 8)))
    }

    /// Read all users enrolled on the device.
    pub async fn get_users(&mut self) -> Result<Vec<User>> {
        let record_size = match self.active_transport()? {
            Transport::Tcp(_) => USER_RECORD_TCP,
            Transport::Udp(_) => USER_RECORD_UDP,
        };

        let data = self.bulk_read(request_data::GET_USERS, None, "GET_USERS").await?;
        Ok(records::parse_users(&data, record_size))
    }

    /// Read the full attendance log, reporting progress through the
    /// optional callback as chunks arrive.
    pub async fn get_attendances(
        &mut self,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<AttendanceRecord>> {
        let record_size = match self.active_transport()? {
            Transport::Tcp(_) => ATT_RECORD_TCP,
            Transport::Udp(_) => ATT_RECORD_UDP,
        };

        let data = self
            .bulk_read(request_data::GET_ATTENDANCE_LOGS, progress, "GET_ATTENDANCE_LOGS")
            .await?;
        Ok(records::parse_attendances(&data, record_size, &self.ip))
    }

    /// Bulk read bracketed by FREE_DATA on both sides, as the device keeps
    /// its send buffer allocated until released.
    async fn bulk_read(
        &mut self,
        request: &[u8],
        progress: Option<ProgressFn<'_>>,
        command: &str,
    ) -> Result<Vec<u8>> {
        let ip = self.ip.clone();
        let transport = self.active_transport()?;

        transport.free_data().await.map_err(|e| e.in_context(&ip, command))?;
        let bulk = transport
            .read_with_buffer(request, progress)
            .await
            .map_err(|e| e.in_context(&ip, command))?;
        transport.free_data().await.map_err(|e| e.in_context(&ip, command))?;

        if let Some(err) = bulk.err {
            warn!(
                "{command} returned a partial buffer of {} bytes: {err}",
                bulk.data.len()
            );
        }
        Ok(bulk.data)
    }

    /// Delete every attendance record on the device.
    pub async fn clear_attendance_log(&mut self) -> Result<()> {
        let reply = self.execute_cmd(CMD_CLEAR_ATTLOG, &[]).await?;
        self.expect_ack(&reply, "CMD_CLEAR_ATTLOG")
    }

    /// Unlock the device for normal user interaction.
    pub async fn enable_device(&mut self) -> Result<()> {
        let reply = self.execute_cmd(CMD_ENABLEDEVICE, &[]).await?;
        self.expect_ack(&reply, "CMD_ENABLEDEVICE")
    }

    /// Lock the device keypad and sensor, typically around bulk transfers.
    pub async fn disable_device(&mut self) -> Result<()> {
        let reply = self
            .execute_cmd(CMD_DISABLEDEVICE, request_data::DISABLE_DEVICE)
            .await?;
        self.expect_ack(&reply, "CMD_DISABLEDEVICE")
    }

    /// Release the device's send-side data buffer.
    pub async fn free_data(&mut self) -> Result<()> {
        let ip = self.ip.clone();
        let transport = self.active_transport()?;
        transport.free_data().await.map_err(|e| e.in_context(&ip, "CMD_FREE_DATA"))
    }

    /// Create or overwrite a user record on the device.
    pub async fn set_user(
        &mut self,
        uid: u16,
        user_id: &str,
        name: &str,
        password: &str,
        role: u8,
        card_no: &str,
    ) -> Result<()> {
        if !(1..=3000).contains(&uid)
            || user_id.len() > 9
            || name.len() > 24
            || password.len() > 8
            || card_no.len() > 10
        {
            return Err(ZkError::Invalid("INVALID_INPUT_PARAMETERS".to_string())
                .in_context(&self.ip, "CMD_USER_WRQ"));
        }
        let card_no: u32 = if card_no.is_empty() {
            0
        } else {
            card_no.parse().map_err(|_| {
                ZkError::Invalid("INVALID_INPUT_PARAMETERS".to_string())
                    .in_context(&self.ip, "CMD_USER_WRQ")
            })?
        };

        let payload = encode_user_72(uid, user_id, name, password, role, card_no);
        let reply = self.execute_cmd(CMD_USER_WRQ, &payload).await?;
        self.expect_ack(&reply, "CMD_USER_WRQ")
    }

    /// Register for real-time attendance events and install the callback.
    ///
    /// Events are delivered while other commands await replies; when the
    /// session is otherwise idle, drive delivery with
    /// [`poll_real_time_event`](Self::poll_real_time_event).
    pub async fn get_real_time_logs(&mut self, callback: RealTimeCallback) -> Result<()> {
        let ip = self.ip.clone();
        let transport = self.active_transport()?;
        transport
            .subscribe_real_time(callback)
            .await
            .map_err(|e| e.in_context(&ip, "CMD_REG_EVENT"))
    }

    /// Wait for the next real-time event, feeding it to the installed
    /// callback and returning it.
    pub async fn poll_real_time_event(&mut self) -> Result<RealTimeEvent> {
        let ip = self.ip.clone();
        let transport = self.active_transport()?;
        transport
            .next_event()
            .await
            .map_err(|e| e.in_context(&ip, "CMD_REG_EVENT"))
    }

    // Device metadata getters. The option table only answers over TCP.

    pub async fn get_serial_number(&mut self) -> Result<String> {
        self.get_device_option("~SerialNumber").await
    }

    pub async fn get_device_version(&mut self) -> Result<String> {
        self.get_device_option("~ZKFPVersion").await
    }

    pub async fn get_device_name(&mut self) -> Result<String> {
        self.get_device_option("~DeviceName").await
    }

    pub async fn get_platform(&mut self) -> Result<String> {
        self.get_device_option("~Platform").await
    }

    pub async fn get_os(&mut self) -> Result<String> {
        self.get_device_option("~OS").await
    }

    pub async fn get_work_code(&mut self) -> Result<String> {
        self.get_device_option("WorkCode").await
    }

    pub async fn get_pin(&mut self) -> Result<String> {
        self.get_device_option("~PIN2Width").await
    }

    /// Whether face recognition is enabled. The device reports "0" for
    /// enabled-off, so the answer is inverted relative to the raw string.
    pub async fn get_face_on(&mut self) -> Result<String> {
        let data = self.get_device_option("FaceFunOn").await?;
        Ok(if data.contains('0') { "No" } else { "Yes" }.to_string())
    }

    pub async fn get_ssr(&mut self) -> Result<String> {
        self.get_device_option("~SSR").await
    }

    /// Firmware version string (its own opcode, not an option keyword).
    pub async fn get_firmware(&mut self) -> Result<String> {
        self.require_tcp("CMD_GET_VERSION")?;
        let reply = self.execute_cmd(CMD_GET_VERSION, &[]).await?;
        Ok(records::extract_ascii(&reply[8.min(reply.len())..]))
    }

    /// Read one keyword from the device option table, stripping the echoed
    /// `keyword=` prefix from the reply.
    pub async fn get_device_option(&mut self, keyword: &str) -> Result<String> {
        self.require_tcp("CMD_OPTIONS_RRQ")?;
        let reply = self.execute_cmd(CMD_OPTIONS_RRQ, keyword.as_bytes()).await?;
        let text = records::extract_ascii(&reply[8.min(reply.len())..]);
        let value = text
            .strip_prefix(&format!("{keyword}="))
            .unwrap_or(&text)
            .to_string();
        Ok(value)
    }

    /// Operations with no UDP encoding are rejected up front.
    fn require_tcp(&self, command: &str) -> Result<()> {
        match self.transport.as_ref() {
            Some(Transport::Tcp(_)) => Ok(()),
            Some(Transport::Udp(_)) => Err(ZkError::Invalid(
                "operation not supported over UDP".to_string(),
            )
            .in_context(&self.ip, command)),
            None => Err(no_transport().in_context(&self.ip, command)),
        }
    }

    /// The active transport, or ECONNREFUSED when there is no usable
    /// socket (never connected, closed, or the tolerated UDP bind
    /// collision left the transport socketless).
    fn active_transport(&mut self) -> Result<&mut Transport> {
        let ip = self.ip.clone();
        match self.transport.as_mut() {
            Some(t) if t.has_socket() => Ok(t),
            Some(_) => Err(no_transport().in_context(&ip, "CMD_CONNECT")),
            None => Err(no_transport().in_context(&ip, "CMD_CONNECT")),
        }
    }

    fn expect_ack(&self, reply: &[u8], command: &str) -> Result<()> {
        let header = parse_udp_header(reply).map_err(|e| e.in_context(&self.ip, command))?;
        if header.command != CMD_ACK_OK {
            return Err(
                ZkError::UnhandledCommand(command_name(header.command).to_string())
                    .in_context(&self.ip, command),
            );
        }
        Ok(())
    }
}

impl Drop for ZkClient {
    fn drop(&mut self) {
        // Cannot send EXIT from a sync drop; dropping the transport closes
        // the socket.
        self.transport.take();
    }
}

fn no_transport() -> ZkError {
    ZkError::ConnectionRefused("no socket instance".to_string())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
