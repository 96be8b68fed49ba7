//! MySQL binary log replication
//!
//! Supports:
//! - MySQL 5.7+, 8.0+ with `binlog_format=ROW`
//! - CRC32 event checksums
//! - Heartbeats for silent-disconnect detection
//! - TABLE_MAP optional metadata (column names, signedness)
//!
//! # Architecture
//!
//! ```text
//! MySQL Binlog → MySqlBinlogClient → BinlogDecoder → BinlogEvent
//! ```
//!
//! The client is blocking on purpose: it runs on the reader's dedicated OS
//! thread, never on the scheduler runtime.

pub mod decoder;
pub mod protocol;

pub use decoder::*;
pub use protocol::*;
