//! Session transports for the ZK protocol.
//!
//! Two sibling implementations own the socket, the device-assigned session
//! id, the reply-id counter, and the request/response state machine. The
//! client façade holds one of them behind [`Transport`] and forwards every
//! operation.

mod tcp;
mod udp;

#[cfg(test)]
mod tests;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use std::time::Duration;

use crate::error::{Result, ZkError};
use crate::protocol::commands::CMD_FREE_DATA;
use crate::protocol::records::RealTimeEvent;

/// Fixed timeout for CONNECT and EXIT, distinct from the per-command one.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle timer during TCP chunked reassembly, reset on every inbound frame.
pub(crate) const TCP_CHUNK_IDLE: Duration = Duration::from_secs(10);

/// Idle timer during UDP chunked reassembly.
pub(crate) const UDP_CHUNK_IDLE: Duration = Duration::from_secs(3);

/// Upper bound on a single announced inner frame, to reject garbage
/// length fields before allocating.
pub(crate) const MAX_FRAME_SIZE: usize = 1_000_000;

/// Callback invoked for every decoded real-time event frame.
pub type RealTimeCallback = Box<dyn FnMut(RealTimeEvent) + Send>;

/// Progress callback for bulk reads: (bytes received, total announced).
pub type ProgressFn<'a> = &'a mut (dyn FnMut(usize, usize) + Send);

/// Result of a bulk read.
///
/// Reassembly timeouts and unexpected socket closes resolve with whatever
/// arrived plus the error, so the caller decides what to do with a partial
/// buffer.
#[derive(Debug)]
pub struct BulkData {
    /// Reassembled payload (the 4-byte count prefix still in front).
    pub data: Vec<u8>,
    /// True when the device answered inline with a single DATA frame and
    /// no chunking took place.
    pub inline: bool,
    /// Set when reassembly ended early; `data` is then partial.
    pub err: Option<ZkError>,
}

/// The active transport of a connected client.
pub enum Transport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
}

impl Transport {
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    pub fn has_socket(&self) -> bool {
        match self {
            Self::Tcp(t) => t.has_socket(),
            Self::Udp(t) => t.has_socket(),
        }
    }

    pub fn session_id(&self) -> Option<u16> {
        match self {
            Self::Tcp(t) => t.session_id(),
            Self::Udp(t) => t.session_id(),
        }
    }

    /// Execute a single command and return the inner reply frame
    /// (8-byte header + body, TCP prefix already stripped).
    pub async fn execute_cmd(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Tcp(t) => t.execute_cmd(command, data).await,
            Self::Udp(t) => t.execute_cmd(command, data).await,
        }
    }

    /// Run a DATA_WRRQ bulk read, reassembling chunked transfers.
    pub async fn read_with_buffer(
        &mut self,
        request: &[u8],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BulkData> {
        match self {
            Self::Tcp(t) => t.read_with_buffer(request, progress).await,
            Self::Udp(t) => t.read_with_buffer(request, progress).await,
        }
    }

    /// Release the device's send-side buffer. Required before and after
    /// every bulk read.
    pub async fn free_data(&mut self) -> Result<()> {
        self.execute_cmd(CMD_FREE_DATA, &[]).await?;
        Ok(())
    }

    /// Enable real-time event delivery and install the callback.
    pub async fn subscribe_real_time(&mut self, callback: RealTimeCallback) -> Result<()> {
        match self {
            Self::Tcp(t) => t.subscribe_real_time(callback).await,
            Self::Udp(t) => t.subscribe_real_time(callback).await,
        }
    }

    /// Block until the next real-time event frame arrives, dispatching it
    /// to the installed callback and returning it. Non-event frames read
    /// while waiting are discarded.
    pub async fn next_event(&mut self) -> Result<RealTimeEvent> {
        match self {
            Self::Tcp(t) => t.next_event().await,
            Self::Udp(t) => t.next_event().await,
        }
    }

    /// Best-effort EXIT, then close the socket.
    pub async fn disconnect(&mut self) -> Result<bool> {
        match self {
            Self::Tcp(t) => t.disconnect().await,
            Self::Udp(t) => t.disconnect().await,
        }
    }

    pub fn socket_status(&self) -> String {
        match self {
            Self::Tcp(t) => t.socket_status(),
            Self::Udp(t) => t.socket_status(),
        }
    }
}
