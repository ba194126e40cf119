//! Traits and types for working with Block Devices.
//!
//! Generic code for handling block devices, such as types for identifying
//! a particular block on a block device by its index.

/// A standard 512 byte block (also known as a sector).
///
/// Almost all SD cards have 512 byte blocks, and SDHC/SDXC cards only
/// support 512 byte blocks.
///
/// This library does not support devices with a block size other than 512
/// bytes.
pub type Block = [u8; BLOCK_LEN];

/// All our blocks are a fixed length of 512 bytes. SDSC cards may advertise
/// a longer native block, but reads are always issued in 512 byte units.
pub const BLOCK_LEN: usize = 512;

/// Sometimes we want `LEN` as a `u32` and the casts don't look nice.
pub const BLOCK_LEN_U32: u32 = 512;

/// Sometimes we want `LEN` as a `u64` and the casts don't look nice.
pub const BLOCK_LEN_U64: u64 = 512;

/// The linear numeric address of a block (or sector).
///
/// The first block on a disk gets `BlockIdx(0)` (which usually contains the
/// Master Boot Record).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub u32);

/// The a number of blocks (or sectors).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockCount(pub u32);

impl BlockCount {
    /// The size of this many blocks, in bytes.
    pub const fn bytes(self) -> u64 {
        self.0 as u64 * BLOCK_LEN_U64
    }

    /// The size of this many blocks, in KiB, rounding an odd trailing block
    /// up.
    ///
    /// ```
    /// # use embedded_sdspi::BlockCount;
    /// assert_eq!(BlockCount(1024).kib(), 512);
    /// assert_eq!(BlockCount(3).kib(), 2);
    /// assert_eq!(BlockCount(u32::MAX).kib(), 0x8000_0000);
    /// ```
    pub const fn kib(self) -> u32 {
        ((self.0 as u64 + 1) / 2) as u32
    }
}

/// A device which can read 512 byte blocks (or sectors).
///
/// There is deliberately no `write` here; this crate only reads.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one block from the given block index.
    fn read(&self, block: &mut Block, block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error>;
}

/// A caching layer for block devices
///
/// Caches a single block.
#[derive(Debug)]
pub struct BlockCache<D> {
    block_device: D,
    block: Block,
    block_idx: Option<BlockIdx>,
}

impl<D> BlockCache<D>
where
    D: BlockDevice,
{
    /// Create a new block cache
    pub fn new(block_device: D) -> BlockCache<D> {
        BlockCache {
            block_device,
            block: [0; BLOCK_LEN],
            block_idx: None,
        }
    }

    /// Read a block, and return a reference to it.
    ///
    /// Asking for the block that is already cached does not touch the device.
    pub fn read(&mut self, block_idx: BlockIdx) -> Result<&Block, D::Error> {
        if self.block_idx != Some(block_idx) {
            self.block_idx = None;
            self.block_device.read(&mut self.block, block_idx)?;
            self.block_idx = Some(block_idx);
        }
        Ok(&self.block)
    }

    /// Which block, if any, is currently cached.
    pub fn cached_idx(&self) -> Option<BlockIdx> {
        self.block_idx
    }

    /// Access the block device
    pub fn block_device(&mut self) -> &mut D {
        // invalidate the cache
        self.block_idx = None;
        // give them the block device
        &mut self.block_device
    }

    /// Get the block device back
    pub fn free(self) -> D {
        self.block_device
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::cell::Cell;

    struct CountingDevice {
        reads: Cell<u32>,
    }

    impl BlockDevice for CountingDevice {
        type Error = ();

        fn read(&self, block: &mut Block, block_idx: BlockIdx) -> Result<(), ()> {
            self.reads.set(self.reads.get() + 1);
            block.fill(block_idx.0 as u8);
            Ok(())
        }

        fn num_blocks(&self) -> Result<BlockCount, ()> {
            Ok(BlockCount(16))
        }
    }

    #[test]
    fn cache_hits_skip_the_device() {
        let mut cache = BlockCache::new(CountingDevice {
            reads: Cell::new(0),
        });
        assert_eq!(cache.read(BlockIdx(3)).unwrap()[0], 3);
        assert_eq!(cache.read(BlockIdx(3)).unwrap()[511], 3);
        assert_eq!(cache.cached_idx(), Some(BlockIdx(3)));
        assert_eq!(cache.read(BlockIdx(4)).unwrap()[0], 4);
        assert_eq!(cache.free().reads.get(), 2);
    }

    #[test]
    fn borrowing_the_device_invalidates() {
        let mut cache = BlockCache::new(CountingDevice {
            reads: Cell::new(0),
        });
        cache.read(BlockIdx(1)).unwrap();
        let _ = cache.block_device();
        assert_eq!(cache.cached_idx(), None);
        cache.read(BlockIdx(1)).unwrap();
        assert_eq!(cache.free().reads.get(), 2);
    }

    #[test]
    fn count_in_bytes() {
        assert_eq!(BlockCount(1024).bytes(), 512 * 1024);
        assert_eq!(BlockCount(u32::MAX).bytes(), 0x1_FFFF_FFFE00);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
