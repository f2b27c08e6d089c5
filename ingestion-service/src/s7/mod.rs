//! Binary device client: S7comm over ISO-on-TCP.
//!
//! The scheduler only sees the `DeviceConnector` / `DeviceSession` seam, so
//! tests can drive it with a scripted device and the real transport stays in
//! `client.rs`.

pub mod client;
pub mod frame;
#[cfg(test)]
pub(crate) mod simulator;
pub mod value;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use client::{S7Connector, S7Session};
pub use value::{decode, encode, Scalar, ValueType};

/// Highest addressable byte of a data block.
pub const MAX_BLOCK_ADDRESS: u32 = 65_535;

pub const DEFAULT_PORT: u16 = 102;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("cannot decode {actual} bytes as {value_type} (expected {expected})")]
    Decode {
        value_type: ValueType,
        expected: usize,
        actual: usize,
    },
    #[error("cannot encode {value} as {value_type}")]
    Encode { value_type: ValueType, value: String },
    #[error("read range out of bounds: offset {offset} + length {length} must stay within 65535")]
    Range { offset: u32, length: u32 },
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Physical endpoint of a controller. Several units may share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub ip: String,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_slot() -> u8 {
    1
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DeviceAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            rack: 0,
            slot: default_slot(),
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (rack {}, slot {})", self.ip, self.port, self.rack, self.slot)
    }
}

/// Reject reads and writes that would run past the end of a data block.
/// Zero-length accesses are rejected too.
pub fn check_range(offset: u32, length: u32) -> Result<(), ProtocolError> {
    let last = u64::from(offset) + u64::from(length);
    if length == 0 || last - 1 > u64::from(MAX_BLOCK_ADDRESS) {
        return Err(ProtocolError::Range { offset, length });
    }
    Ok(())
}

#[async_trait::async_trait]
pub trait DeviceConnector: Send + Sync {
    type Session: DeviceSession + 'static;

    async fn connect(&self, address: &DeviceAddress) -> Result<Self::Session, ProtocolError>;
}

#[async_trait::async_trait]
pub trait DeviceSession: Send {
    /// Read `length` raw bytes at `offset` of data block `block`.
    async fn read(&mut self, block: u16, offset: u32, length: u32) -> Result<Bytes, ProtocolError>;

    /// Write `data` at `offset` of data block `block`.
    async fn write(&mut self, block: u16, offset: u32, data: &[u8]) -> Result<(), ProtocolError>;

    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_bounds_the_last_byte() {
        assert!(check_range(65_534, 2).is_ok());
        assert!(check_range(0, 65_536).is_ok());
        assert_eq!(
            check_range(65_534, 3),
            Err(ProtocolError::Range { offset: 65_534, length: 3 })
        );
        assert!(check_range(10, 0).is_err());
        assert!(check_range(u32::MAX, u32::MAX).is_err());
    }
}
