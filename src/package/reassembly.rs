//! Rebuilding packages from chunks.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::{Chunk, Package, PackageId};

/// Concatenates a complete chunk set back into a package.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reassembler;

impl Reassembler {
    /// Sort `chunks` by sequence number and concatenate their data.
    ///
    /// The input order is not trusted. Gaps and duplicates are not
    /// checked here: pass a complete, deduplicated set (see
    /// [`InboundPackage`]). The package keeps the chunks' identifier; an
    /// empty set yields an empty package under a fresh identifier.
    pub fn reassemble(mut chunks: Vec<Chunk>) -> Package {
        chunks.sort_by_key(|chunk| chunk.sequence_number);

        let id = chunks
            .first()
            .map(|chunk| chunk.package_id)
            .unwrap_or_else(PackageId::random);
        let total: usize = chunks.iter().map(Chunk::size).sum();

        let mut data = Vec::with_capacity(total);
        for chunk in &chunks {
            data.extend_from_slice(&chunk.data);
        }
        Package::with_id(id, data)
    }
}

/// What happened to a chunk offered to an [`InboundPackage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk stored.
    Accepted,
    /// Sequence number already stored; data ignored.
    Duplicate,
    /// Sequence number not below the package's total.
    OutOfRange,
    /// Declared total differs from the one the package was opened with.
    InconsistentTotal,
}

impl ChunkOutcome {
    /// Check if the chunk should be acknowledged to the sender.
    ///
    /// Duplicates are re-acknowledged in case the first ACK was lost.
    pub fn should_ack(self) -> bool {
        matches!(self, Self::Accepted | Self::Duplicate)
    }
}

/// Chunks of one inbound package, collected until complete.
#[derive(Debug, Clone)]
pub struct InboundPackage {
    id: PackageId,
    total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
}

impl InboundPackage {
    /// Start collecting `total` chunks for `id`.
    pub fn new(id: PackageId, total: u32) -> Self {
        Self {
            id,
            total,
            chunks: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Package identifier.
    pub fn id(&self) -> PackageId {
        self.id
    }

    /// Expected chunk count.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Distinct chunks received so far.
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Bytes received so far.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Check if chunk `seq` is stored.
    pub fn contains(&self, seq: u32) -> bool {
        self.chunks.contains_key(&seq)
    }

    /// Offer chunk `seq` of a `total`-chunk package.
    pub fn insert(&mut self, seq: u32, total: u32, data: Vec<u8>) -> ChunkOutcome {
        if total != self.total {
            debug!(package = %self.id, expected = self.total, got = total, "inconsistent chunk total");
            return ChunkOutcome::InconsistentTotal;
        }
        if seq >= self.total {
            debug!(package = %self.id, seq, total, "chunk out of range");
            return ChunkOutcome::OutOfRange;
        }
        if self.chunks.contains_key(&seq) {
            trace!(package = %self.id, seq, "duplicate chunk");
            return ChunkOutcome::Duplicate;
        }
        self.bytes += data.len();
        self.chunks.insert(seq, data);
        ChunkOutcome::Accepted
    }

    /// Check if every chunk has arrived.
    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    /// Rebuild the package once complete; otherwise hand `self` back.
    pub fn into_package(self) -> Result<Package, Self> {
        if !self.is_complete() {
            return Err(self);
        }
        let id = self.id;
        let chunks = self
            .chunks
            .into_iter()
            .map(|(seq, data)| Chunk::new(id, seq, data))
            .collect();
        let package = Reassembler::reassemble(chunks);
        debug!(package = %id, size = package.size(), "package reassembled");
        // An empty package has no chunk to carry the id.
        Ok(Package::with_id(id, package.into_data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Chunker;
    use proptest::prelude::*;

    #[test]
    fn test_reassemble_out_of_order() {
        let package = Package::new(b"hello, ground station".to_vec());
        let mut chunks = Chunker::new(5).split(&package).unwrap();
        chunks.reverse();

        let rebuilt = Reassembler::reassemble(chunks);
        assert_eq!(rebuilt.data(), package.data());
        assert_eq!(rebuilt.id(), package.id());
    }

    #[test]
    fn test_reassemble_empty() {
        let rebuilt = Reassembler::reassemble(Vec::new());
        assert!(rebuilt.is_empty());
    }

    #[test]
    fn test_inbound_completion() {
        let id = PackageId::random();
        let mut inbound = InboundPackage::new(id, 3);

        assert_eq!(inbound.insert(2, 3, b"ef".to_vec()), ChunkOutcome::Accepted);
        assert_eq!(inbound.insert(0, 3, b"ab".to_vec()), ChunkOutcome::Accepted);
        assert!(!inbound.is_complete());

        let mut inbound = inbound.into_package().unwrap_err();
        assert_eq!(inbound.insert(1, 3, b"cd".to_vec()), ChunkOutcome::Accepted);
        assert!(inbound.is_complete());
        assert_eq!(inbound.bytes(), 6);

        let package = inbound.into_package().unwrap();
        assert_eq!(package.id(), id);
        assert_eq!(package.data(), b"abcdef");
    }

    #[test]
    fn test_inbound_rejects() {
        let mut inbound = InboundPackage::new(PackageId::random(), 2);
        assert_eq!(inbound.insert(0, 2, vec![1]), ChunkOutcome::Accepted);
        assert_eq!(inbound.insert(0, 2, vec![9]), ChunkOutcome::Duplicate);
        assert_eq!(inbound.insert(2, 2, vec![1]), ChunkOutcome::OutOfRange);
        assert_eq!(inbound.insert(1, 5, vec![1]), ChunkOutcome::InconsistentTotal);
        assert_eq!(inbound.received(), 1);
        assert!(ChunkOutcome::Duplicate.should_ack());
        assert!(!ChunkOutcome::OutOfRange.should_ack());
    }

    #[test]
    fn test_inbound_empty_package() {
        let id = PackageId::random();
        let inbound = InboundPackage::new(id, 0);
        assert!(inbound.is_complete());
        let package = inbound.into_package().unwrap();
        assert_eq!(package.id(), id);
        assert!(package.is_empty());
    }

    /// A payload with its chunks in arbitrary order.
    fn shuffled_chunks() -> impl Strategy<Value = (Vec<u8>, usize, Vec<Chunk>)> {
        (proptest::collection::vec(any::<u8>(), 0..4096), 1usize..512).prop_flat_map(
            |(data, chunk_size)| {
                let package = Package::new(data.clone());
                let chunks = Chunker::new(chunk_size).split(&package).unwrap();
                (Just(data), Just(chunk_size), Just(chunks).prop_shuffle())
            },
        )
    }

    proptest! {
        #[test]
        fn prop_split_reassemble_any_order((data, chunk_size, chunks) in shuffled_chunks()) {
            prop_assert_eq!(chunks.len(), data.len().div_ceil(chunk_size));
            let rebuilt = Reassembler::reassemble(chunks);
            prop_assert_eq!(rebuilt.data(), &data[..]);
        }
    }
}
