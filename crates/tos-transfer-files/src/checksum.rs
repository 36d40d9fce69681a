//! CRC-64 integrity digests.
//!
//! Uses CRC-64/XZ (ECMA-182 polynomial, reflected, all-ones init and xor-out),
//! which is what the service reports in `x-tos-hash-crc64ecma`. Part digests
//! are computed independently and combined in part order.

use crc::{CRC_64_XZ, Crc};
use std::collections::BTreeMap;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Reflected ECMA-182 polynomial
const POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

/// CRC-64 of a buffer
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// CRC of `A || B` given `crc(A)`, `crc(B)` and `len(B)`
pub fn crc64_combine(crc_a: u64, crc_b: u64, len_b: u64) -> u64 {
    if len_b == 0 {
        return crc_a;
    }

    // odd: operator for one zero bit
    let mut odd = [0u64; 64];
    odd[0] = POLY_REFLECTED;
    let mut row = 1u64;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    let mut even = [0u64; 64];
    gf2_matrix_square(&mut even, &odd); // two zero bits
    gf2_matrix_square(&mut odd, &even); // four zero bits

    let mut crc = crc_a;
    let mut len = len_b;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
    }

    crc ^ crc_b
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (n, slot) in square.iter_mut().enumerate() {
        *slot = gf2_matrix_times(mat, mat[n]);
    }
}

/// Streaming CRC-64 of one part
#[derive(Clone)]
pub struct PartChecksum {
    digest: crc::Digest<'static, u64>,
    len: u64,
}

impl PartChecksum {
    /// Start an empty digest
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    /// Feed bytes
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if nothing has been fed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current CRC without consuming the digest
    pub fn value(&self) -> u64 {
        self.digest.clone().finalize()
    }

    /// Finish, returning `(crc, len)`
    pub fn finish(self) -> (u64, u64) {
        (self.digest.finalize(), self.len)
    }
}

impl Default for PartChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects part digests in any order and combines them in index order
#[derive(Debug, Clone, Default)]
pub struct ChecksumAccumulator {
    parts: BTreeMap<u32, (u64, u64)>,
}

impl ChecksumAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the digest of part `index`
    ///
    /// Recording the same index twice replaces the earlier value, so a
    /// retried part never contributes twice.
    pub fn insert(&mut self, index: u32, crc: u64, len: u64) {
        self.parts.insert(index, (crc, len));
    }

    /// Number of recorded parts
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Total bytes covered by recorded parts
    pub fn total_len(&self) -> u64 {
        self.parts.values().map(|(_, len)| len).sum()
    }

    /// True if indices `0..count` are all present
    pub fn is_complete(&self, count: usize) -> bool {
        self.parts.len() == count && self.parts.keys().copied().eq(0..count as u32)
    }

    /// Whole-payload CRC, combining parts in index order
    pub fn combined(&self) -> u64 {
        self.parts
            .values()
            .fold(0u64, |acc, &(crc, len)| crc64_combine(acc, crc, len))
    }
}
