use std::f64::consts::LN_2;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_64_ECMA_182, CRC_64_XZ};

use crate::error::{Error, Result};

const HASH_A: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const HASH_B: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

const MIN_BITS: usize = 64;

/// Membership filter over raw keys. Sized analytically from the
/// expected insertion count and target false positive probability,
/// probed with double hashing `h1 + i * h2`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    hash_count: u32,
    bits: Vec<u8>,
}

/// Write-side filter, frozen into a [`BloomFilter`] by `finish`.
pub struct BloomFilterBuilder {
    filter: BloomFilter,
}

fn optimal_bit_count(expected: usize, fpp: f64) -> usize {
    let n = expected.max(1) as f64;
    let bits = (-n * fpp.ln() / (LN_2 * LN_2)).ceil() as usize;
    bits.max(MIN_BITS)
}

fn optimal_hash_count(bits: usize, expected: usize) -> u32 {
    let per_key = bits as f64 / expected.max(1) as f64;
    ((per_key * LN_2).round() as u32).max(1)
}

fn hash_pair(raw: &[u8]) -> (i64, i64) {
    (
        HASH_A.checksum(raw) as i64,
        HASH_B.checksum(raw) as i64,
    )
}

impl BloomFilterBuilder {
    pub fn new(expected: usize, fpp: f64) -> Self {
        let bit_count = optimal_bit_count(expected, fpp);
        Self {
            filter: BloomFilter {
                hash_count: optimal_hash_count(bit_count, expected),
                bits: vec![0u8; (bit_count + 7) / 8],
            },
        }
    }

    pub fn insert(&mut self, raw: &[u8]) {
        let (h1, h2) = hash_pair(raw);
        let bit_len = self.filter.bit_len();
        for i in 0..self.filter.hash_count {
            let bit = probe_bit(h1, h2, i, bit_len);
            self.filter.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn finish(self) -> BloomFilter {
        self.filter
    }
}

/// Fold the signed combined hash into a bit position. Negative hashes
/// are bit-complemented rather than taken modulo, matching the usual
/// double-hashing construction.
fn probe_bit(h1: i64, h2: i64, i: u32, bit_len: usize) -> usize {
    let mut combined = h1.wrapping_add((i as i64).wrapping_mul(h2));
    if combined < 0 {
        combined = !combined;
    }
    (combined as u64 % bit_len as u64) as usize
}

impl BloomFilter {
    fn bit_len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// True when `raw` may have been inserted; false means definitely
    /// absent.
    pub fn might_contain(&self, raw: &[u8]) -> bool {
        let (h1, h2) = hash_pair(raw);
        let bit_len = self.bit_len();
        for i in 0..self.hash_count {
            let bit = probe_bit(h1, h2, i, bit_len);
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serialize as `{hash_count u32, bitset bytes}`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.bits.len());
        let _ = buf.write_u32::<BigEndian>(self.hash_count);
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<BloomFilter> {
        if buf.len() < 5 {
            return Err(Error::corrupt("bloom filter", "shorter than header"));
        }
        let hash_count = BigEndian::read_u32(&buf[..4]);
        if hash_count == 0 {
            return Err(Error::corrupt("bloom filter", "zero hash count"));
        }
        Ok(BloomFilter {
            hash_count,
            bits: buf[4..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut builder = BloomFilterBuilder::new(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000u32)
            .map(|i| format!("key-{i}").into_bytes())
            .collect();
        for key in &keys {
            builder.insert(key);
        }
        let filter = builder.finish();
        for key in &keys {
            assert!(filter.might_contain(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut builder = BloomFilterBuilder::new(1000, 0.01);
        for i in 0..1000u32 {
            builder.insert(format!("present-{i}").as_bytes());
        }
        let filter = builder.finish();

        let mut false_positives = 0;
        for i in 0..10_000u32 {
            if filter.might_contain(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Target is 1%; allow generous slack over 10k probes.
        assert!(false_positives < 500, "false positives: {false_positives}");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut builder = BloomFilterBuilder::new(100, 0.05);
        builder.insert(b"alpha");
        builder.insert(b"beta");
        let filter = builder.finish();

        let decoded = BloomFilter::decode(&filter.encode()).unwrap();
        assert_eq!(decoded.hash_count(), filter.hash_count());
        assert!(decoded.might_contain(b"alpha"));
        assert!(decoded.might_contain(b"beta"));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(BloomFilter::decode(&[0, 0]).is_err());
        assert!(BloomFilter::decode(&[0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_tiny_expected_count_still_works() {
        let mut builder = BloomFilterBuilder::new(0, 0.01);
        builder.insert(b"only");
        let filter = builder.finish();
        assert!(filter.might_contain(b"only"));
        assert!(filter.hash_count() >= 1);
    }
}
