use thiserror::Error;

/// Error type for block operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    #[error("Sector out of bounds (greater than the block size)")]
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    #[error("Invalid buffer size (not `BLOCK_SECTOR_SIZE`)")]
    BufferInvalid,
    /// Error reading from the disk
    #[error("Error reading from the block device")]
    ReadError,
    /// Error writing to the disk
    #[error("Error writing to the block device")]
    WriteError,
}
