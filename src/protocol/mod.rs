//! ZK binary protocol: command table, frame codec, record layouts, timestamps.
//!
//! Everything in this module is pure and does no I/O; the transport layer
//! drives these codecs against the socket.

pub mod commands;
pub mod frame;
pub mod records;
pub mod time;
