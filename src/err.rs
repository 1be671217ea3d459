// ===== Error Types =====

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// No response to the very first wake command, slot is empty.
    NoCard,
    /// A command aborted the enclosing operation, tagged with its index.
    CommandFailed(u8),
    Timeout,
    Crc,
    DataTimeout,
    DataCrc,
    /// Card is not in the state the operation requires.
    InvalidState,
    /// CMD8 echoed a corrupted check pattern.
    PatternIntegrity,
    InvalidArgument,
    OverlappedPartition,
    /// Lock request not aligned to the write-protect group size.
    LockUnaligned,
    LockFailure,
    EraseFailure,
    MemoryError,
    NotSupported,
    UnsupportedCard,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::NoCard => write!(f, "No card detected"),
            SdError::CommandFailed(cmd) => write!(f, "Command CMD{} failed", cmd),
            SdError::Timeout => write!(f, "Command timeout error"),
            SdError::Crc => write!(f, "Command CRC error"),
            SdError::DataTimeout => write!(f, "Data timeout error"),
            SdError::DataCrc => write!(f, "Data CRC error"),
            SdError::InvalidState => write!(f, "Card in invalid state"),
            SdError::PatternIntegrity => write!(f, "Check pattern integrity error"),
            SdError::InvalidArgument => write!(f, "Invalid argument"),
            SdError::OverlappedPartition => write!(f, "Partition overlaps an existing partition"),
            SdError::LockUnaligned => write!(f, "Lock region not write-protect group aligned"),
            SdError::LockFailure => write!(f, "Write protect command failed"),
            SdError::EraseFailure => write!(f, "Erase failure"),
            SdError::MemoryError => write!(f, "Out of memory"),
            SdError::NotSupported => write!(f, "Operation not supported"),
            SdError::UnsupportedCard => write!(f, "Unsupported card"),
        }
    }
}
