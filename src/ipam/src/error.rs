use thiserror::Error;

use super::bitset::BitSetError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("BitSet error: {0}")]
    BitSet(#[source] BitSetError),

    #[error("Protocol mismatch: {0} does not belong to the range family")]
    ProtocolMismatch(String),

    #[error("provided value {value} is not in the valid range {range}")]
    OutOfRange { value: String, range: String },

    #[error("provided value {0} is already allocated")]
    AlreadyAllocated(String),

    #[error("CIDR too small: {0}")]
    CIDRTooSmall(String),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("range is full")]
    Full,

    #[error("failed to get lock")]
    FailedToGetLock,
}
