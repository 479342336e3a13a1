//! Succinct Elias-Fano encoding for monotone, unsigned 64-bit sequences.
//!
//! An [`EliasFano`] vector supports `get(i)` (indexed access), `search(x)`
//! (predecessor/successor), and forward iteration in roughly `n*l + 2n`
//! bits, where `l = floor(log2(u/n))`.

use crate::error::{ArchiveError, ArchiveResult};

const WORD_BITS: u64 = 64;

/// Builder and query structure for a succinct monotone integer sequence.
///
/// Values are added in non-decreasing order via [`EliasFano::add_offset`],
/// then finalized with [`EliasFano::build`]. Queries are only meaningful
/// after `build` has run.
#[derive(Clone, Debug)]
pub struct EliasFano {
    count: u64,
    max_offset: u64,
    low_bits: u64,
    num_buckets: u64,
    lower: Vec<u64>,
    upper: Vec<u64>,
    upper_bit_len: u64,
    jump: Vec<u32>,
    jump_period: u64,
    word_ones_prefix: Vec<u64>,
    next_index: u64,
    last_added: Option<u64>,
    built: bool,
}

impl EliasFano {
    /// Pre-sizes the lower/upper buffers for `count` values whose maximum is
    /// `max_offset` (inclusive). Uses the section-6 default jump period
    /// (`Q = 64`); see [`EliasFano::with_jump_period`] to override it.
    pub fn new(count: u64, max_offset: u64) -> Self {
        Self::with_jump_period(count, max_offset, 64)
    }

    /// Like [`EliasFano::new`], with an explicit jump table period.
    pub fn with_jump_period(count: u64, max_offset: u64, jump_period: u64) -> Self {
        let low_bits = if count > 0 && max_offset / count > 0 {
            (max_offset / count).ilog2() as u64
        } else {
            0
        };
        // Standard Elias-Fano bucketing: the high part of a value is
        // `v >> low_bits`, which ranges over `(max_offset >> low_bits) + 1`
        // buckets. This is a true bound for every monotone sequence
        // (unlike a fixed `2^ceil(log2(count))` bucket count, which can be
        // too small for skewed distributions).
        let num_buckets = (max_offset >> low_bits) + 1;
        let upper_bit_len = count + num_buckets;

        let lower_words = ((count * low_bits) as usize).div_ceil(WORD_BITS as usize);
        let upper_words = (upper_bit_len as usize).div_ceil(WORD_BITS as usize);

        Self {
            count,
            max_offset,
            low_bits,
            num_buckets,
            lower: vec![0u64; lower_words],
            upper: vec![0u64; upper_words],
            upper_bit_len,
            jump: Vec::new(),
            jump_period: jump_period.max(1),
            word_ones_prefix: Vec::new(),
            next_index: 0,
            last_added: None,
            built: false,
        }
    }

    /// Appends the next value. Values must be added in non-decreasing order;
    /// once `count` values have been added (or after [`EliasFano::build`]
    /// has run), further calls are rejected with `InvalidEncoding`.
    pub fn add_offset(&mut self, v: u64) -> ArchiveResult<()> {
        if self.built {
            return Err(ArchiveError::InvalidEncoding(
                "add_offset called after build".into(),
            ));
        }
        if self.next_index >= self.count {
            return Err(ArchiveError::InvalidEncoding(
                "add_offset exceeds declared count".into(),
            ));
        }
        if let Some(last) = self.last_added {
            if v < last {
                return Err(ArchiveError::InvalidEncoding(format!(
                    "add_offset({v}) is less than previously added {last}"
                )));
            }
        }
        if v > self.max_offset {
            return Err(ArchiveError::InvalidEncoding(format!(
                "add_offset({v}) exceeds declared max_offset {}",
                self.max_offset
            )));
        }

        let i = self.next_index;
        self.set_low(i, v & low_mask(self.low_bits));
        let bucket = v >> self.low_bits;
        let upper_pos = i + bucket;
        set_bit(&mut self.upper, upper_pos);

        self.last_added = Some(v);
        self.next_index += 1;
        Ok(())
    }

    /// Finalizes the vector: computes the jump table and freezes the
    /// structure against further `add_offset` calls.
    pub fn build(&mut self) {
        self.word_ones_prefix = prefix_popcount(&self.upper);
        self.jump = build_jump_table(&self.upper, self.upper_bit_len, self.jump_period);
        self.built = true;
    }

    /// Number of values in the vector.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The maximum value (inclusive) the vector was constructed to hold.
    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Returns the value at ordinal `i`.
    pub fn get(&self, i: u64) -> ArchiveResult<u64> {
        if i >= self.count {
            return Err(ArchiveError::OutOfBounds {
                ordinal: i,
                count: self.count,
            });
        }
        let pos = self.select1(i);
        let high = pos - i;
        let low = self.get_low(i);
        Ok((high << self.low_bits) | low)
    }

    /// Returns the least value `>= x`, and whether one exists. Ties (an
    /// exact match to a repeated value) resolve to the smallest ordinal
    /// holding that value.
    pub fn search(&self, x: u64) -> (u64, bool) {
        if self.count == 0 || x > self.max_offset {
            return (0, false);
        }
        // Binary search over ordinals for the leftmost i with get(i) >= x.
        let mut lo = 0u64;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let v = self.get(mid).expect("mid is within count");
            if v >= x {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let v = self.get(lo).expect("lo is within count after narrowing");
        (v, true)
    }

    /// A lazy, restartable forward iterator over all values.
    pub fn iter(&self) -> EliasFanoIter<'_> {
        EliasFanoIter { ef: self, next: 0 }
    }

    fn get_low(&self, i: u64) -> u64 {
        if self.low_bits == 0 {
            return 0;
        }
        read_bits(&self.lower, i * self.low_bits, self.low_bits)
    }

    fn set_low(&mut self, i: u64, value: u64) {
        if self.low_bits == 0 {
            return;
        }
        write_bits(&mut self.lower, i * self.low_bits, self.low_bits, value);
    }

    /// Position (bit index) of the `i`-th one-bit (0-indexed) in the upper
    /// array, using the jump table to skip to a nearby word.
    fn select1(&self, i: u64) -> u64 {
        let jt_idx = (i / self.jump_period) as usize;
        let mut word_idx = self.jump.get(jt_idx).copied().unwrap_or(0) as usize;
        let mut ones_before = self.word_ones_prefix[word_idx];
        // The jump table only ever points at or before the target; if for
        // any reason it overshoots, fall back to the start.
        if ones_before > i {
            word_idx = 0;
            ones_before = 0;
        }
        let mut remaining = i - ones_before;
        loop {
            let w = self.upper[word_idx];
            let c = w.count_ones() as u64;
            if remaining < c {
                return word_idx as u64 * WORD_BITS + select_in_word(w, remaining);
            }
            remaining -= c;
            word_idx += 1;
        }
    }
}

/// Forward iterator over the values of an [`EliasFano`] vector.
pub struct EliasFanoIter<'a> {
    ef: &'a EliasFano,
    next: u64,
}

impl Iterator for EliasFanoIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.ef.count {
            return None;
        }
        let v = self.ef.get(self.next).expect("iterator index in bounds");
        self.next += 1;
        Some(v)
    }
}

impl EliasFanoIter<'_> {
    /// Whether a subsequent call to `next()` would yield a value.
    pub fn has_next(&self) -> bool {
        self.next < self.ef.count
    }
}

// ---------------------------------------------------------------------
// Bit-twiddling helpers
// ---------------------------------------------------------------------

fn low_mask(bits: u64) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn set_bit(words: &mut [u64], pos: u64) {
    let w = (pos / WORD_BITS) as usize;
    let b = pos % WORD_BITS;
    words[w] |= 1u64 << b;
}

fn select_in_word(mut w: u64, mut rank: u64) -> u64 {
    loop {
        let tz = w.trailing_zeros() as u64;
        if rank == 0 {
            return tz;
        }
        w &= w - 1;
        rank -= 1;
    }
}

fn prefix_popcount(words: &[u64]) -> Vec<u64> {
    let mut prefix = Vec::with_capacity(words.len() + 1);
    let mut acc = 0u64;
    prefix.push(0);
    for w in words {
        acc += w.count_ones() as u64;
        prefix.push(acc);
    }
    prefix
}

fn build_jump_table(upper: &[u64], upper_bit_len: u64, period: u64) -> Vec<u32> {
    let total_ones: u64 = upper.iter().map(|w| w.count_ones() as u64).sum();
    if total_ones == 0 {
        return Vec::new();
    }
    let num_entries = (total_ones.saturating_sub(1)) / period + 1;
    let mut jump = Vec::with_capacity(num_entries as usize);
    let mut ones_seen = 0u64;
    let mut word_idx = 0usize;
    let mut next_target = 0u64;
    let total_words = upper_bit_len.div_ceil(WORD_BITS) as usize;
    while (jump.len() as u64) < num_entries && word_idx < total_words {
        let w = upper[word_idx];
        let c = w.count_ones() as u64;
        while next_target < ones_seen + c && (jump.len() as u64) < num_entries {
            jump.push(word_idx as u32);
            next_target += period;
        }
        ones_seen += c;
        word_idx += 1;
    }
    jump
}

fn read_bits(words: &[u64], start: u64, len: u64) -> u64 {
    let mut result = 0u64;
    let mut filled = 0u64;
    let mut pos = start;
    while filled < len {
        let w = (pos / WORD_BITS) as usize;
        let b = pos % WORD_BITS;
        let avail = WORD_BITS - b;
        let take = avail.min(len - filled);
        let chunk = (words[w] >> b) & low_mask(take);
        result |= chunk << filled;
        filled += take;
        pos += take;
    }
    result
}

fn write_bits(words: &mut [u64], start: u64, len: u64, value: u64) {
    let mut written = 0u64;
    let mut pos = start;
    while written < len {
        let w = (pos / WORD_BITS) as usize;
        let b = pos % WORD_BITS;
        let avail = WORD_BITS - b;
        let take = avail.min(len - written);
        let chunk = (value >> written) & low_mask(take);
        words[w] |= chunk << b;
        written += take;
        pos += take;
    }
}

// ---------------------------------------------------------------------
// On-disk serialization, bit-exact across encode/decode
// ---------------------------------------------------------------------

impl EliasFano {
    /// Serializes the vector: big-endian `count` and `u` headers, then the
    /// lower-bits blob, the upper-bits blob, and the jump table (big-endian
    /// u32 word offsets), all little-endian 64-bit-word packed for the bit
    /// blobs.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.max_offset.to_be_bytes());
        for w in &self.lower {
            out.extend_from_slice(&w.to_le_bytes());
        }
        for w in &self.upper {
            out.extend_from_slice(&w.to_le_bytes());
        }
        for j in &self.jump {
            out.extend_from_slice(&j.to_be_bytes());
        }
        out
    }

    /// Decodes a vector previously produced by [`EliasFano::encode`].
    pub fn decode(buf: &[u8]) -> ArchiveResult<Self> {
        if buf.len() < 16 {
            return Err(ArchiveError::InvalidEncoding(
                "elias-fano buffer shorter than 16-byte header".into(),
            ));
        }
        let count = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let max_offset = u64::from_be_bytes(buf[8..16].try_into().unwrap());

        let mut ef = EliasFano::new(count, max_offset);
        let mut pos = 16usize;

        let lower_bytes = ef.lower.len() * 8;
        if buf.len() < pos + lower_bytes {
            return Err(ArchiveError::InvalidEncoding(
                "elias-fano buffer truncated in lower-bits blob".into(),
            ));
        }
        for (i, w) in ef.lower.iter_mut().enumerate() {
            let s = pos + i * 8;
            *w = u64::from_le_bytes(buf[s..s + 8].try_into().unwrap());
        }
        pos += lower_bytes;

        let upper_bytes = ef.upper.len() * 8;
        if buf.len() < pos + upper_bytes {
            return Err(ArchiveError::InvalidEncoding(
                "elias-fano buffer truncated in upper-bits blob".into(),
            ));
        }
        for (i, w) in ef.upper.iter_mut().enumerate() {
            let s = pos + i * 8;
            *w = u64::from_le_bytes(buf[s..s + 8].try_into().unwrap());
        }
        pos += upper_bytes;

        let remaining_jump_bytes = buf.len() - pos;
        let jump_len = remaining_jump_bytes / 4;
        ef.jump = Vec::with_capacity(jump_len);
        for i in 0..jump_len {
            let s = pos + i * 4;
            ef.jump
                .push(u32::from_be_bytes(buf[s..s + 4].try_into().unwrap()));
        }

        ef.word_ones_prefix = prefix_popcount(&ef.upper);
        ef.next_index = count;
        ef.built = true;
        Ok(ef)
    }
}

/// Builds a finalized `EliasFano` over an already-sorted slice in one call.
pub fn build_from_sorted(values: &[u64]) -> ArchiveResult<EliasFano> {
    let max_offset = values.last().copied().unwrap_or(0);
    let mut ef = EliasFano::new(values.len() as u64, max_offset);
    for &v in values {
        ef.add_offset(v)?;
    }
    ef.build();
    Ok(ef)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EF_BASIC: [u64; 19] = [
        1, 4, 6, 8, 10, 14, 16, 19, 22, 34, 37, 39, 41, 43, 48, 51, 54, 58, 62,
    ];

    #[test]
    fn ef_basic_get_and_search() {
        let ef = build_from_sorted(&EF_BASIC).unwrap();
        assert_eq!(ef.get(0).unwrap(), 1);
        assert_eq!(ef.get(9).unwrap(), 34);
        assert_eq!(ef.search(37), (37, true));
        assert_eq!(ef.search(0), (1, true));
        assert_eq!(ef.search(100), (0, false));
        assert_eq!(ef.search(11), (14, true));
    }

    #[test]
    fn ef_iter_yields_input_order() {
        let ef = build_from_sorted(&EF_BASIC).unwrap();
        let collected: Vec<u64> = ef.iter().collect();
        assert_eq!(collected, EF_BASIC.to_vec());

        let mut it = ef.iter();
        for _ in 0..EF_BASIC.len() {
            assert!(it.has_next());
            it.next();
        }
        assert!(!it.has_next());
    }

    #[test]
    fn ef_round_trip_every_ordinal() {
        let ef = build_from_sorted(&EF_BASIC).unwrap();
        for (i, &v) in EF_BASIC.iter().enumerate() {
            assert_eq!(ef.get(i as u64).unwrap(), v);
        }
    }

    #[test]
    fn ef_out_of_bounds() {
        let ef = build_from_sorted(&EF_BASIC).unwrap();
        assert!(matches!(
            ef.get(EF_BASIC.len() as u64),
            Err(ArchiveError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn ef_encode_decode_round_trip() {
        let ef = build_from_sorted(&EF_BASIC).unwrap();
        let bytes = ef.encode();
        let decoded = EliasFano::decode(&bytes).unwrap();
        for i in 0..EF_BASIC.len() as u64 {
            assert_eq!(ef.get(i).unwrap(), decoded.get(i).unwrap());
        }
        assert_eq!(decoded.search(37), (37, true));
        assert_eq!(decoded.search(100), (0, false));
    }

    #[test]
    fn ef_empty_vector() {
        let ef = build_from_sorted(&[]).unwrap();
        assert_eq!(ef.count(), 0);
        assert_eq!(ef.search(5), (0, false));
        assert_eq!(ef.iter().collect::<Vec<_>>(), Vec::<u64>::new());
    }

    #[test]
    fn ef_rejects_non_monotone_input() {
        let mut ef = EliasFano::new(2, 10);
        ef.add_offset(5).unwrap();
        assert!(ef.add_offset(3).is_err());
    }

    #[test]
    fn ef_large_matches_binary_search() {
        // A large monotone vector with a wide value spread: search() must
        // agree with a plain sorted-slice binary search at every queried
        // point, not just on the small hand-picked fixture above.
        let mut values = Vec::with_capacity(500);
        let mut v = 3u64;
        for i in 0..500u64 {
            v += 1 + (i * 37 + 11) % 101;
            values.push(v);
        }
        let ef = build_from_sorted(&values).unwrap();

        let queries = [
            0u64,
            values[0],
            values[250] - 1,
            values[250],
            values[499],
            values[499] + 1,
            22_325_642 % (values[499] + 1),
        ];
        for &x in &queries {
            let want = values.binary_search(&x);
            let (got_val, got_found) = ef.search(x);
            match want {
                Ok(idx) => {
                    assert!(got_found);
                    assert_eq!(got_val, values[idx]);
                }
                Err(idx) => {
                    if idx == values.len() {
                        assert!(!got_found);
                    } else {
                        assert!(got_found);
                        assert_eq!(got_val, values[idx]);
                    }
                }
            }
        }
    }

    #[test]
    fn ef_randomized_round_trip_and_search() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xE1A5_FA40);
        for _trial in 0..20 {
            let n = rng.gen_range(0..200);
            let mut values = Vec::with_capacity(n);
            let mut v = 0u64;
            for _ in 0..n {
                v += rng.gen_range(1..=50);
                values.push(v);
            }

            let ef = build_from_sorted(&values).unwrap();
            assert_eq!(ef.count(), values.len() as u64);
            for (i, &want) in values.iter().enumerate() {
                assert_eq!(ef.get(i as u64).unwrap(), want);
            }

            let bytes = ef.encode();
            let decoded = EliasFano::decode(&bytes).unwrap();

            let max = values.last().copied().unwrap_or(0);
            for _ in 0..20 {
                let query = if max == 0 { 0 } else { rng.gen_range(0..=max + 5) };
                let want = match values.binary_search(&query) {
                    Ok(idx) => (values[idx], true),
                    Err(idx) if idx < values.len() => (values[idx], true),
                    Err(_) => (0, false),
                };
                assert_eq!(ef.search(query), want);
                assert_eq!(decoded.search(query), want);
            }
        }
    }
}
