use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::error::Result;
use crate::identity::{Mapping, MappingArbiter};
use crate::store::PhysicalId;

use super::Node;

const READ_CHUNK: usize = 64 * 1024;

/// An open cached file body.
///
/// Holds the physical file that was canonical at open time. Reads always
/// see the latest bytes of that file; a later republish by rename is only
/// seen by a fresh open.
#[derive(Debug)]
pub struct OpenFile {
    node: Node,
    file: File,
    generation: PhysicalId,
    mappings: Arc<MappingArbiter>,
}

impl OpenFile {
    pub(crate) fn new(
        node: Node,
        file: File,
        generation: PhysicalId,
        mappings: Arc<MappingArbiter>,
    ) -> Self {
        Self {
            node,
            file,
            generation,
            mappings,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Physical file backing this open
    pub fn generation(&self) -> PhysicalId {
        self.generation
    }

    /// Current size of the backing file
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Read up to `size` bytes at `offset`; short only at end of file
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(out.len() as u64, READ_CHUNK)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Map the body into memory.
    ///
    /// Fails with `MappingConflict` if live mappings of the same node were
    /// created from a physical file that has since been replaced.
    pub fn map(&self) -> Result<Mapping> {
        let lease = self
            .mappings
            .acquire(self.node.id, &self.node.path, self.generation)?;
        Mapping::new(&self.file, self.generation, lease)
    }
}
