use crate::block::block_error::BlockError;
use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::fmt;
use kidneyos_shared::sizes::SECTOR_SIZE;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// What a block device holds, as far as the memory manager cares.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// Swap space
    Swap,
    /// Owned by another operating system; never written
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// Tha name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    pub fn new(
        block_name: &str,
        block_type: BlockType,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        // Ensure that we are not writing to a foreign block
        assert!(
            self.block_type != BlockType::Foreign,
            "Cannot write to foreign block"
        );

        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn read_count(&self) -> u32 {
        self.read_count
    }
    pub fn write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

/// A RAM-backed block driver.
///
/// Used as the swap device when no disk is attached, and by the tests.
pub struct MemDisk {
    sectors: Vec<[u8; BLOCK_SECTOR_SIZE]>,
}

impl MemDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize],
        }
    }

    /// Wraps a new disk of `sectors` sectors in a [`Block`] of the given type.
    pub fn into_block(self, block_name: &str, block_type: BlockType) -> Block {
        #[allow(clippy::cast_possible_truncation)]
        let size = self.sectors.len() as BlockSector;
        Block::new(block_name, block_type, size, Box::new(self))
    }
}

impl BlockOp for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let data = self
            .sectors
            .get(sector as usize)
            .ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let data = self
            .sectors
            .get_mut(sector as usize)
            .ok_or(BlockError::WriteError)?;
        data.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_sector() {
        let mut block = MemDisk::new(4).into_block("swap", BlockType::Swap);
        let data = [0xAB; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        block.read(1, &mut buf).unwrap();
        assert_eq!(buf, [0; BLOCK_SECTOR_SIZE]);
        assert_eq!(block.read_count(), 2);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut block = MemDisk::new(4).into_block("swap", BlockType::Swap);
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(
            block.write(0, &buf[..10]),
            Err(BlockError::BufferInvalid)
        );
        assert_eq!(block.read_count(), 0);
        assert_eq!(block.write_count(), 0);
    }

    #[test]
    #[should_panic]
    fn foreign_blocks_are_read_only() {
        let mut block = MemDisk::new(1).into_block("other", BlockType::Foreign);
        let _ = block.write(0, &[0; BLOCK_SECTOR_SIZE]);
    }
}
