//! The pool of named shared-state blocks.
//!
//! A block is a name and a fixed run of bytes, no schema: every node that
//! touches "mood" must agree on what those 16 bytes mean. The size is fixed
//! at first allocation and enforced exactly on every read and write. A
//! mismatched size is a reported error, never a truncated copy.
//!
//! The dirty flag drives replication: set on local writes, cleared when the
//! block has been broadcast. Writes applied from the mesh clear it instead,
//! so a replicated value doesn't bounce straight back out.

use heapless::{String, Vec};

use crate::MeshError;

/// Slots in the pool.
pub const MAX_BLOCKS: usize = 32;

/// Largest block, sized so any block fits a single wire frame with its name.
pub const MAX_BLOCK_SIZE: usize = 128;

/// Longest block name (NUL excluded; names are stored as str).
pub const MAX_BLOCK_NAME: usize = 31;

#[derive(Clone, Debug)]
pub(crate) struct SharedBlock {
    pub(crate) name: String<MAX_BLOCK_NAME>,
    /// Length fixed at allocation; the Vec stays full.
    pub(crate) data: Vec<u8, MAX_BLOCK_SIZE>,
    pub(crate) dirty: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BlockPool {
    pub(crate) blocks: Vec<SharedBlock, MAX_BLOCKS>,
}

impl BlockPool {
    pub fn new() -> Self {
        BlockPool::default()
    }

    /// Allocates `name` with exactly `size` bytes, zero-filled. Allocating
    /// an existing name with the same size is a no-op (components may re-run
    /// init); with a different size it is an error, never a silent reuse.
    pub fn alloc(&mut self, name: &str, size: usize) -> Result<(), MeshError> {
        if name.is_empty() || name.len() > MAX_BLOCK_NAME {
            return Err(MeshError::NameTooLong);
        }
        if size == 0 || size > MAX_BLOCK_SIZE {
            return Err(MeshError::BadBlockSize(size));
        }
        if let Some(block) = self.blocks.iter().find(|b| b.name.as_str() == name) {
            if block.data.len() == size {
                return Ok(());
            }
            return Err(MeshError::SizeMismatch {
                expected: block.data.len(),
                got: size,
            });
        }
        let mut data = Vec::new();
        data.resize(size, 0).unwrap();
        self.blocks
            .push(SharedBlock {
                name: String::try_from(name).unwrap(),
                data,
                dirty: false,
            })
            .map_err(|_| MeshError::PoolFull)?;
        Ok(())
    }

    /// Overwrites the block's bytes and marks it dirty. `bytes` must match
    /// the allocated size exactly.
    pub fn write(&mut self, name: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let block = self.find_mut(name)?;
        if bytes.len() != block.data.len() {
            return Err(MeshError::SizeMismatch {
                expected: block.data.len(),
                got: bytes.len(),
            });
        }
        block.data.copy_from_slice(bytes);
        block.dirty = true;
        Ok(())
    }

    /// Copies the block's bytes into `out`, which must match the allocated
    /// size exactly.
    pub fn read(&self, name: &str, out: &mut [u8]) -> Result<(), MeshError> {
        let block = self
            .blocks
            .iter()
            .find(|b| b.name.as_str() == name)
            .ok_or(MeshError::UnknownBlock)?;
        if out.len() != block.data.len() {
            return Err(MeshError::SizeMismatch {
                expected: block.data.len(),
                got: out.len(),
            });
        }
        out.copy_from_slice(&block.data);
        Ok(())
    }

    /// Applies a value received from a peer: last writer wins, and the block
    /// comes out clean (a replicated write is not re-announced).
    pub fn apply_remote(&mut self, name: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let block = self.find_mut(name)?;
        if bytes.len() != block.data.len() {
            return Err(MeshError::SizeMismatch {
                expected: block.data.len(),
                got: bytes.len(),
            });
        }
        block.data.copy_from_slice(bytes);
        block.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self, name: &str) -> Option<bool> {
        self.blocks.iter().find(|b| b.name.as_str() == name).map(|b| b.dirty)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut SharedBlock, MeshError> {
        self.blocks
            .iter_mut()
            .find(|b| b.name.as_str() == name)
            .ok_or(MeshError::UnknownBlock)
    }
}
