//! Presence bitmap and its bucketed prefix-sum rank cache.
//!
//! The bitmap answers "is block B stored in the image?"; the cache makes
//! "how many stored blocks precede B?" cheap. Both are built once at load
//! time and shared read-only by every connection.

/// Word-packed presence bitmap: bit `b` of word `w` covers source block
/// `64 * w + b`.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<u64>,
    blocks: u64,
}

impl Bitmap {
    /// Wraps pre-built words covering `blocks` source blocks.
    ///
    /// Bits at positions `>= blocks` are forced to zero so that rank queries
    /// and padding blocks agree regardless of what the producer left in the
    /// trailing word.
    pub fn from_words(mut words: Vec<u64>, blocks: u64) -> Self {
        debug_assert!(words.len() as u64 >= blocks.div_ceil(64));
        let tail_bits = (blocks % 64) as u32;
        if tail_bits != 0 {
            if let Some(last) = words.get_mut((blocks / 64) as usize) {
                *last &= low_bits(tail_bits);
            }
        }
        for word in words.iter_mut().skip(blocks.div_ceil(64) as usize) {
            *word = 0;
        }
        Self { words, blocks }
    }

    /// Number of source blocks covered, including synthetic tail blocks.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Backing words, `ceil(blocks / 64)` or more of them.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Residency of one block. Out-of-range blocks read as absent.
    pub fn get(&self, block: u64) -> bool {
        if block >= self.blocks {
            return false;
        }
        let word = self.words[(block / 64) as usize];
        (word >> (block % 64)) & 1 == 1
    }

    /// Total number of present blocks.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}

/// Bucketed prefix sums over the bitmap's popcount.
///
/// `sums[k]` is the number of present blocks covered by bitmap words
/// `[0, k * words_per_bucket)`; by construction `sums[0] == 0`. A rank query
/// starts from the bucket sum and popcounts at most `words_per_bucket`
/// words, so the bucket width trades memory for per-query work.
#[derive(Clone, Debug)]
pub struct RankCache {
    sums: Vec<u64>,
    words_per_bucket: u64,
}

impl RankCache {
    /// Builds the cache. `words_per_bucket` must be nonzero.
    pub fn build(bitmap: &Bitmap, words_per_bucket: u64) -> Self {
        assert!(words_per_bucket > 0, "cache bucket width must be nonzero");

        let words = bitmap.words();
        let buckets = (words.len() as u64).div_ceil(words_per_bucket).max(1);
        let mut sums = Vec::with_capacity(buckets as usize);

        let mut carry = 0_u64;
        for bucket in 0..buckets {
            sums.push(carry);
            let start = (bucket * words_per_bucket) as usize;
            let end = (start + words_per_bucket as usize).min(words.len());
            carry += words[start..end]
                .iter()
                .map(|w| u64::from(w.count_ones()))
                .sum::<u64>();
        }

        Self {
            sums,
            words_per_bucket,
        }
    }

    /// Number of present blocks in `[0, block)`.
    ///
    /// Valid for `block` up to and including `bitmap.blocks()`; for a present
    /// block this is also its position in the packed data region.
    pub fn rank(&self, bitmap: &Bitmap, block: u64) -> u64 {
        let words = bitmap.words();
        let word_index = (block / 64) as usize;
        let bit = (block % 64) as u32;

        let bucket = word_index / self.words_per_bucket as usize;
        let bucket = bucket.min(self.sums.len() - 1);
        let mut total = self.sums[bucket];

        let start = bucket * self.words_per_bucket as usize;
        for word in &words[start..word_index.min(words.len())] {
            total += u64::from(word.count_ones());
        }

        if bit != 0 && word_index < words.len() {
            total += u64::from((words[word_index] & low_bits(bit)).count_ones());
        }

        total
    }

    /// The bucket sums, exposed for consistency checks.
    pub fn sums(&self) -> &[u64] {
        &self.sums
    }

    /// Configured bucket width in bitmap words.
    pub fn words_per_bucket(&self) -> u64 {
        self.words_per_bucket
    }
}

/// A mask of the `bits` lowest bits; all zeros when `bits == 0`.
///
/// Shifting a u64 by 64 is not defined, hence the explicit branch.
fn low_bits(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        u64::MAX >> (64 - bits)
    }
}
