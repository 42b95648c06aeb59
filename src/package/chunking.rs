//! Splitting packages into packet-sized chunks.

use super::{Package, PackageId};
use crate::core::SessionError;

/// One contiguous slice of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Package the chunk belongs to.
    pub package_id: PackageId,
    /// Position within the package, from 0.
    pub sequence_number: u32,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Build a chunk.
    pub fn new(package_id: PackageId, sequence_number: u32, data: Vec<u8>) -> Self {
        Self {
            package_id,
            sequence_number,
            data,
        }
    }

    /// Chunk length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Splits packages into chunks of at most `chunk_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// Create a chunker. A zero size is raised to 1.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks a package of `len` bytes splits into.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Split `package` in byte order.
    ///
    /// Every chunk but the last is exactly `chunk_size` bytes; the last
    /// holds the remainder. An empty package yields no chunks.
    pub fn split(&self, package: &Package) -> Result<Vec<Chunk>, SessionError> {
        if u32::try_from(self.chunk_count(package.size())).is_err() {
            return Err(SessionError::PackageTooLarge(package.size()));
        }
        Ok(package
            .data()
            .chunks(self.chunk_size)
            .zip(0u32..)
            .map(|(data, seq)| Chunk::new(package.id(), seq, data.to_vec()))
            .collect())
    }
}
