use bit_vec::BitVec;
use seahash::hash_seeded;

/// Bloom filter over store keys. Lets `get` answer most misses without
/// touching the key index or the segment file.
pub struct BloomFilter {
    bits: BitVec,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` keys at the given false positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        // m = -(n * ln(p)) / (ln(2)^2), k = (m / n) * ln(2)
        let m = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(8.0);
        let k = ((m / n) * ln2).ceil().max(1.0);

        Self {
            bits: BitVec::from_elem(m as usize, false),
            num_hashes: k as u32,
        }
    }

    pub fn insert(&mut self, key: &str) {
        for idx in self.positions(key) {
            self.bits.set(idx, true);
        }
    }

    /// `false` means the key was never inserted. `true` means it might have been.
    pub fn might_contain(&self, key: &str) -> bool {
        self.positions(key).all(|idx| self.bits.get(idx).unwrap_or(false))
    }

    // Kirsch-Mitzenmacher: g_i(x) = h1(x) + i * h2(x)
    fn positions(&self, key: &str) -> impl Iterator<Item = usize> {
        let bytes = key.as_bytes();
        let h1 = hash_seeded(bytes, 0x16f1_1fe8_9b0d_677c, 0xb480_a793_d8e6_c86c, 0x6fe2_e5aa_f078_ebc9, 0x14f9_94a4_c525_9381);
        let h2 = hash_seeded(bytes, 0x9e37_79b9_7f4a_7c15, 0xbf58_476d_1ce4_e5b9, 0x94d0_49bb_1331_11eb, 0x2545_f491_4f6c_dd1d) | 1;
        let m = self.bits.len() as u64;
        (0..self.num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_always_reported() {
        let mut bf = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            bf.insert(&format!("video:{}", i));
        }
        for i in 0..1_000 {
            assert!(bf.might_contain(&format!("video:{}", i)));
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let mut bf = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            bf.insert(&format!("video:{}", i));
        }
        let hits = (0..10_000).filter(|i| bf.might_contain(&format!("hash:{}", i))).count();
        assert!(hits < 500, "too many false positives: {}", hits);
    }

    #[test]
    fn empty_filter_reports_nothing() {
        let bf = BloomFilter::new(100, 0.01);
        assert!(!bf.might_contain("video:abc"));
        assert!(!bf.might_contain(""));
    }
}
