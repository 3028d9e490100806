//! Error types and handling.

use std::fmt;

use thiserror::Error;

/// Timeout classification for the distinct timers in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Writing a request frame to the socket timed out.
    OnWritingMessage,
    /// No reply arrived for an executed command.
    OnReceivingRequestData,
    /// No response arrived after a DATA_WRRQ bulk-read request.
    InReceivingResponseAfterRequestingData,
    /// The chunk-idle timer expired during bulk-read reassembly.
    WhenReceivingPacket,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OnWritingMessage => "TIMEOUT_ON_WRITING_MESSAGE",
            Self::OnReceivingRequestData => "TIMEOUT_ON_RECEIVING_REQUEST_DATA",
            Self::InReceivingResponseAfterRequestingData => {
                "TIMEOUT_IN_RECEIVING_RESPONSE_AFTER_REQUESTING_DATA"
            }
            Self::WhenReceivingPacket => "TIMEOUT_WHEN_RECEIVING_PACKET",
        };
        f.write_str(msg)
    }
}

/// Errors that can occur during ZK protocol communication.
#[derive(Error, Debug)]
pub enum ZkError {
    /// IO error during socket operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No socket, or the device rejected the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Another controller grabbed the device mid-session.
    #[error("Connection reset by device")]
    ConnectionReset,

    /// Local UDP bind collision. Not fatal for the UDP path.
    #[error("Local address in use: {0}")]
    AddrInUse(String),

    /// One of the protocol timers expired.
    #[error("Timeout: {0}")]
    Timeout(TimeoutKind),

    /// Bad input parameters, or the operation is unsupported on this transport.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Device answered with a command code outside the expected set.
    #[error("Unhandled response command: {0}")]
    UnhandledCommand(String),

    /// Device returned a malformed or truncated frame.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Socket closed while a caller was awaiting a reply.
    #[error("SOCKET_DISCONNECTED_UNEXPECTEDLY")]
    SocketDisconnected,

    /// An error annotated with the device address and the failing command.
    #[error("{command} failed for {ip}: {source}")]
    Command {
        ip: String,
        command: String,
        #[source]
        source: Box<ZkError>,
    },
}

impl ZkError {
    /// Taxonomy code for this error, matching the conventional errno-style names.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
                std::io::ErrorKind::ConnectionReset => "ECONNRESET",
                std::io::ErrorKind::AddrInUse => "EADDRINUSE",
                std::io::ErrorKind::TimedOut => "ETIMEDOUT",
                _ => "EIO",
            },
            Self::ConnectionRefused(_) => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::AddrInUse(_) => "EADDRINUSE",
            Self::Timeout(_) => "ETIMEDOUT",
            Self::Invalid(_) => "EINVALID",
            Self::UnhandledCommand(_) => "UNHANDLED_CMD",
            Self::InvalidResponse(_) => "EBADRESPONSE",
            Self::SocketDisconnected => "ECONNRESET",
            Self::Command { source, .. } => source.code(),
        }
    }

    /// Wrap this error with the device IP and the command that failed.
    ///
    /// Already-wrapped errors are returned unchanged so nested call sites
    /// keep the innermost command name.
    pub fn in_context(self, ip: &str, command: &str) -> Self {
        match self {
            Self::Command { .. } => self,
            other => Self::Command {
                ip: ip.to_string(),
                command: command.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// True when the underlying cause is a refused connection.
    pub(crate) fn is_refused(&self) -> bool {
        match self {
            Self::ConnectionRefused(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            Self::Command { source, .. } => source.is_refused(),
            _ => false,
        }
    }
}

/// Result type for ZK protocol operations.
pub type Result<T> = std::result::Result<T, ZkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ZkError::Timeout(TimeoutKind::WhenReceivingPacket).code(), "ETIMEDOUT");
        assert_eq!(ZkError::Invalid("x".into()).code(), "EINVALID");
        assert_eq!(ZkError::UnhandledCommand("CMD_ACK_ERROR".into()).code(), "UNHANDLED_CMD");
    }

    #[test]
    fn test_context_wraps_once() {
        let err = ZkError::SocketDisconnected
            .in_context("192.168.1.201", "CMD_GET_TIME")
            .in_context("10.0.0.1", "CMD_EXIT");

        match err {
            ZkError::Command { ip, command, .. } => {
                assert_eq!(ip, "192.168.1.201");
                assert_eq!(command, "CMD_GET_TIME");
            }
            other => panic!("expected Command wrapper, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_messages() {
        assert_eq!(
            ZkError::Timeout(TimeoutKind::OnWritingMessage).to_string(),
            "Timeout: TIMEOUT_ON_WRITING_MESSAGE"
        );
    }
}
