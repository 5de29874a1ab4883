use crate::{Block, BlockDevice, BlockIdx};

/// Holds the most recently used block. Writes go straight through to the
/// device, so the cache never holds anything the card doesn't.
#[derive(Debug)]
pub(crate) struct BlockCache {
    block_idx: Option<BlockIdx>,
    block: Block,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            block_idx: None,
            block: Block::new(),
        }
    }

    pub fn read<BD>(&mut self, block_device: &mut BD, block_idx: BlockIdx) -> Result<&Block, BD::Error>
    where
        BD: BlockDevice,
    {
        self.load(block_device, block_idx)?;
        Ok(&self.block)
    }

    /// Change part of a block and write it back.
    pub fn modify<BD, F, R>(
        &mut self,
        block_device: &mut BD,
        block_idx: BlockIdx,
        f: F,
    ) -> Result<R, BD::Error>
    where
        BD: BlockDevice,
        F: FnOnce(&mut Block) -> R,
    {
        self.load(block_device, block_idx)?;
        let result = f(&mut self.block);
        if let Err(e) = block_device.write_block(&self.block, block_idx) {
            self.block_idx = None;
            return Err(e);
        }
        Ok(result)
    }

    /// Replace a whole block without reading it first.
    pub fn write<BD>(
        &mut self,
        block_device: &mut BD,
        block: &Block,
        block_idx: BlockIdx,
    ) -> Result<(), BD::Error>
    where
        BD: BlockDevice,
    {
        if self.block_idx == Some(block_idx) {
            self.block_idx = None;
        }
        block_device.write_block(block, block_idx)
    }

    fn load<BD>(&mut self, block_device: &mut BD, block_idx: BlockIdx) -> Result<(), BD::Error>
    where
        BD: BlockDevice,
    {
        if self.block_idx != Some(block_idx) {
            self.block_idx = None;
            block_device.read(core::slice::from_mut(&mut self.block), block_idx, "cache")?;
            self.block_idx = Some(block_idx);
        }
        Ok(())
    }
}
