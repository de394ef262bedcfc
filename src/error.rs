//! Error types for lan-ipam-rs.

use thiserror::Error;

use crate::types::{AddressId, AddressStatus, SegmentId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("Gateway {gateway} is not a usable address of {cidr}")]
    InvalidGateway { gateway: String, cidr: String },

    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("CIDR {cidr} overlaps existing segment {existing}")]
    CidrOverlap { cidr: String, existing: String },

    #[error("CIDR {cidr} has {hosts} usable addresses, limit is {limit}")]
    SegmentTooLarge { cidr: String, hosts: u64, limit: u64 },

    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentId),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    #[error("Address {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: AddressId,
        from: AddressStatus,
        to: AddressStatus,
    },

    #[error("Probing unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("Status cache write failed: {0}")]
    CacheWrite(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCidr { .. } => "InvalidCidr",
            Self::InvalidGateway { .. } => "InvalidGateway",
            Self::InvalidAddress(_) => "InvalidAddress",
            Self::InvalidMac(_) => "InvalidMac",
            Self::CidrOverlap { .. } => "CidrOverlap",
            Self::SegmentTooLarge { .. } => "SegmentTooLarge",
            Self::SegmentNotFound(_) => "SegmentNotFound",
            Self::AddressNotFound(_) => "AddressNotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::ProbeUnavailable(_) => "ProbeUnavailable",
            Self::CacheWrite(_) => "CacheWriteFailure",
            Self::Storage(_) => "StorageError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
