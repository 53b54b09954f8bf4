//! Compact membership filters for header blocks.
//!
//! A Golomb-coded set over the puzzle hashes of a block's additions and the
//! coin ids of its removals, keyed by the block's header hash. Light
//! clients test membership against the filter instead of downloading the
//! coin deltas; false positives are possible (about 1/M), false negatives
//! are not.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::types::Bytes32;

/// Golomb-Rice remainder width.
const P: u32 = 19;
/// Inverse false-positive rate; element hashes map onto `[0, n * M)`.
const M: u64 = 784_931;

/// Serialize: element count (u32 LE) followed by the Golomb-Rice coded
/// deltas of the sorted, deduplicated element hashes.
pub fn build_filter(key: Bytes32, elements: &[Vec<u8>]) -> Vec<u8> {
    let mut mapped: Vec<u64> = elements
        .iter()
        .map(|element| hash_to_range(key, element, elements.len() as u64))
        .collect();
    mapped.sort_unstable();
    mapped.dedup();

    let mut out = vec![0u8; 4];
    LittleEndian::write_u32(&mut out, elements.len() as u32);

    let mut writer = BitWriter::new(out);
    let mut previous = 0u64;
    for value in mapped {
        let delta = value - previous;
        previous = value;
        // unary quotient, then P remainder bits
        let quotient = delta >> P;
        for _ in 0..quotient {
            writer.write_bit(true);
        }
        writer.write_bit(false);
        writer.write_bits(delta & ((1 << P) - 1), P);
    }
    writer.finish()
}

/// Membership test. False positives at ~1/M; no false negatives.
pub fn filter_matches(filter: &[u8], key: Bytes32, element: &[u8]) -> bool {
    if filter.len() < 4 {
        return false;
    }
    let count = LittleEndian::read_u32(&filter[..4]) as u64;
    if count == 0 {
        return false;
    }
    let target = hash_to_range(key, element, count);

    let mut reader = BitReader::new(&filter[4..]);
    let mut value = 0u64;
    loop {
        let mut quotient = 0u64;
        loop {
            match reader.read_bit() {
                Some(true) => quotient += 1,
                Some(false) => break,
                None => return false,
            }
        }
        let remainder = match reader.read_bits(P) {
            Some(bits) => bits,
            None => return false,
        };
        value += (quotient << P) | remainder;
        if value == target {
            return true;
        }
        if value > target {
            return false;
        }
    }
}

fn hash_to_range(key: Bytes32, element: &[u8], n: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(element);
    let digest = hasher.finalize();
    let h = BigEndian::read_u64(&digest[..8]);
    // multiply-shift maps the 64-bit hash uniformly onto [0, n * M)
    ((h as u128 * (n * M) as u128) >> 64) as u64
}

struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn new(bytes: Vec<u8>) -> Self {
        BitWriter { bytes, bit_pos: 0 }
    }

    fn write_bit(&mut self, bit: bool) {
        if self.bit_pos == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> self.bit_pos;
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    fn write_bits(&mut self, value: u64, width: u32) {
        for i in (0..width).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        BitReader { bytes, position: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let byte = self.bytes.get(self.position / 8)?;
        let bit = (byte >> (7 - (self.position % 8))) & 1 == 1;
        self.position += 1;
        Some(bit)
    }

    fn read_bits(&mut self, width: u32) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Some(value)
    }
}
