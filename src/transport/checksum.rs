//! CRC-32C (Castagnoli) checksum.
//!
//! Reflected CRC-32 over polynomial `0x82F63B78`, table-driven, with
//! initial value and final XOR of `0xFFFFFFFF`.

use std::sync::OnceLock;

/// Reflected Castagnoli polynomial.
pub const CRC32C_POLYNOMIAL: u32 = 0x82F6_3B78;

static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

fn table() -> &'static [u32; 256] {
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC32C_POLYNOMIAL
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        table
    })
}

/// Incremental CRC-32C over several discontiguous slices.
#[derive(Debug, Clone, Copy)]
pub struct Crc32c {
    state: u32,
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32c {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        let table = table();
        self.state = data.iter().fold(self.state, |crc, &byte| {
            table[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
        });
    }

    /// Final checksum value.
    pub fn finalize(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

/// Compute the CRC-32C of `data`.
pub fn calculate(data: &[u8]) -> u32 {
    let mut crc = Crc32c::new();
    crc.update(data);
    crc.finalize()
}

/// Check `data` against an expected CRC-32C.
pub fn verify(data: &[u8], expected: u32) -> bool {
    calculate(data) == expected
}
