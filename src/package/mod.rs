//! Packages: application byte blobs transported as one logical unit.
//!
//! A [`Package`] is split into [`Chunk`]s sized for one packet payload
//! ([`Chunker`]), and rebuilt on the receiving side ([`Reassembler`],
//! [`InboundPackage`]).

mod chunking;
mod reassembly;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use chunking::{Chunk, Chunker};
pub use reassembly::{ChunkOutcome, InboundPackage, Reassembler};

/// Errors parsing a [`PackageId`] from text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParsePackageIdError {
    /// Not exactly 32 characters.
    #[error("package id must be 32 hex characters, got {0}")]
    InvalidLength(usize),

    /// Not hexadecimal.
    #[error("package id is not hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Globally unique package identifier: 128 random bits, written as 32
/// lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(u128);

impl PackageId {
    /// Draw a fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Wrap a raw value (as carried in the packet `packageId` field).
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn as_u128(self) -> u128 {
        self.0
    }

    /// Big-endian bytes.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for PackageId {
    type Err = ParsePackageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParsePackageIdError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(u128::from_be_bytes(bytes)))
    }
}

/// An application-level byte blob. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    id: PackageId,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl Package {
    /// Wrap `data` under a fresh random identifier.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_id(PackageId::random(), data)
    }

    /// A zero-filled package of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0u8; size])
    }

    /// Wrap `data` under a known identifier.
    pub fn with_id(id: PackageId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry, replacing any previous value for `key`.
    ///
    /// Metadata is local: it is not transmitted.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Identifier.
    pub fn id(&self) -> PackageId {
        self.id
    }

    /// Content.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the content.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Content length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if the content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Metadata value for `key`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// All metadata entries.
    pub fn metadata_entries(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_id_format() {
        let id = PackageId::random();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(text.parse::<PackageId>().unwrap(), id);

        assert_eq!(
            PackageId::from_u128(0xAB).to_string(),
            "000000000000000000000000000000ab"
        );
    }

    #[test]
    fn test_package_id_parse_errors() {
        assert_eq!(
            "abc".parse::<PackageId>(),
            Err(ParsePackageIdError::InvalidLength(3))
        );
        assert_eq!(
            "zz000000000000000000000000000000".parse::<PackageId>(),
            Err(ParsePackageIdError::InvalidHex(
                hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 }
            ))
        );
    }

    #[test]
    fn test_package_ids_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| PackageId::random()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_package_contents() {
        let package = Package::new(b"telemetry".to_vec())
            .with_metadata("kind", "telemetry")
            .with_metadata("kind", "housekeeping");
        assert_eq!(package.size(), 9);
        assert_eq!(package.data(), b"telemetry");
        assert_eq!(package.metadata("kind"), Some("housekeeping"));
        assert_eq!(package.metadata("missing"), None);
        assert_eq!(package.metadata_entries().len(), 1);

        let zeroed = Package::zeroed(4);
        assert_eq!(zeroed.data(), &[0, 0, 0, 0]);
        assert!(Package::new(Vec::new()).is_empty());
    }
}
