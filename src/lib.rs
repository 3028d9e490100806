//! Client for ZKTeco attendance terminals (binary ZK protocol, port 4370).
//!
//! Speaks the command/response protocol over TCP with its custom framing
//! prefix, falling back to UDP datagrams when the device refuses TCP.
//! Supports reading users and attendance logs (chunked bulk transfers),
//! device options and counters, writing users, and real-time attendance
//! events.
//!
//! # Example
//!
//! ```ignore
//! use zkteco_client::ZkClient;
//!
//! #[tokio::main]
//! async fn main() -> zkteco_client::Result<()> {
//!     let mut client = ZkClient::new("192.168.1.201", 4370, 10_000, 5200);
//!     client.connect().await?;
//!
//!     let info = client.get_info().await?;
//!     println!("{} users, {} attendance records", info.user_counts, info.log_counts);
//!
//!     let records = client.get_attendances(None).await?;
//!     println!("downloaded {} punches", records.len());
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ConnectionType, DeviceInfo, ZkClient};
pub use error::{Result, TimeoutKind, ZkError};
pub use protocol::records::{AttendanceRecord, RealTimeEvent, User};
