//! Block devices behind a `RefCell`, for when the volume is not the only
//! user of the card.

use core::cell::RefCell;

use super::{Block, BlockCount, BlockDevice, BlockIdx};

/// Owning the cell means no runtime borrow is needed.
impl<D> BlockDevice for RefCell<D>
where
    D: BlockDevice,
{
    type Error = D::Error;

    fn read(&mut self, blocks: &mut [Block], start: BlockIdx, reason: &str) -> Result<(), D::Error> {
        self.get_mut().read(blocks, start, reason)
    }

    fn write(&mut self, blocks: &[Block], start: BlockIdx) -> Result<(), D::Error> {
        self.get_mut().write(blocks, start)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, D::Error> {
        self.get_mut().num_blocks()
    }
}

/// Each call holds the borrow until the transfer is done. Calling in from
/// inside another transfer on the same cell panics.
impl<D> BlockDevice for &RefCell<D>
where
    D: BlockDevice,
{
    type Error = D::Error;

    fn read(&mut self, blocks: &mut [Block], start: BlockIdx, reason: &str) -> Result<(), D::Error> {
        self.borrow_mut().read(blocks, start, reason)
    }

    fn write(&mut self, blocks: &[Block], start: BlockIdx) -> Result<(), D::Error> {
        self.borrow_mut().write(blocks, start)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, D::Error> {
        self.borrow_mut().num_blocks()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
