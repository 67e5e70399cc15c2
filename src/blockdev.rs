//! `embedded-sdmmc` block-device adapter over the SD protocol driver.
//!
//! The FAT layer addresses the card as 512-byte sectors; multi-block
//! requests are serviced as a loop of single-sector protocol operations,
//! no batching. Sync is handled above this layer (`flush_file`), so the
//! block level has no buffering of its own.

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};

use crate::sdspi::{SdError, SdSpi};

/// Fixed sector size of the card protocol.
pub const SECTOR_SIZE: usize = 512;
/// Erase block size in sectors, as reported to callers that ask.
pub const ERASE_BLOCK_SIZE: u32 = 1;

/// Wraps [`SdSpi`] for consumption by `embedded_sdmmc::VolumeManager`,
/// which drives block devices through `&self`.
pub struct SdBlockDevice<SPI, CS, D> {
    card: RefCell<SdSpi<SPI, CS, D>>,
}

impl<SPI, CS, D> SdBlockDevice<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    /// Takes ownership of an (ideally already initialized) card driver.
    pub fn new(card: SdSpi<SPI, CS, D>) -> Self {
        Self {
            card: RefCell::new(card),
        }
    }

    /// Ready means the init handshake has completed on the card.
    pub fn is_ready(&self) -> bool {
        self.card.borrow().is_initialized()
    }

    /// Hand the card driver back, e.g. to re-run `initialize`.
    pub fn into_inner(self) -> SdSpi<SPI, CS, D> {
        self.card.into_inner()
    }
}

impl<SPI, CS, D> BlockDevice for SdBlockDevice<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    type Error = SdError<SPI::Error>;

    fn read(
        &self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let mut card = self.card.borrow_mut();
        if !card.is_initialized() {
            return Err(SdError::NotInitialized);
        }
        for (i, block) in blocks.iter_mut().enumerate() {
            card.read_block(start_block_idx.0 + i as u32, &mut block.contents)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut card = self.card.borrow_mut();
        if !card.is_initialized() {
            return Err(SdError::NotInitialized);
        }
        for (i, block) in blocks.iter().enumerate() {
            card.write_block(start_block_idx.0 + i as u32, &block.contents)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        if !self.card.borrow().is_initialized() {
            return Err(SdError::NotInitialized);
        }
        // The minimal init handshake stops short of capacity discovery
        // (no CMD9); the filesystem sizes itself from the partition
        // table, so report the whole addressable range.
        Ok(BlockCount(u32::MAX))
    }
}
