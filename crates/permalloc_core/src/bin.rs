//! Size classes.
//!
//! Small bins run from 16 to 128 bytes in steps of 16, then four evenly
//! spaced steps per power of two, up to half a chunk:
//!
//! ```text
//! 16 32 48 64 80 96 112 128 | 160 192 224 256 | 320 384 448 512 | ...
//! ```
//!
//! Rounding a request up to its bin therefore wastes less than 16 bytes or
//! a quarter of the request, whichever is larger. Every bin size is a
//! multiple of 16, so every small block is 16-byte aligned.
//!
//! Requests above half a chunk are large: bin `small_count + k - 1` holds
//! objects spanning `k` whole chunks.
//!
//! The table depends only on `(chunk_size, max_segment_size)`. Changing the
//! progression changes which chunk holds which block, so it is tied to
//! [`BIN_TABLE_VERSION`] and through it to the on-disk format.

/// Version of the size-class progression.
pub const BIN_TABLE_VERSION: u32 = 1;

/// Index of a size class.
pub type BinIndex = usize;

/// Smallest bin size and the alignment of every small block.
pub const MIN_BIN_SIZE: usize = 16;

const LINEAR_LIMIT: usize = 128;
const STEPS_PER_DOUBLING: usize = 4;

/// Maps request sizes to size classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinTable {
    chunk_size: usize,
    max_chunks: usize,
    small_sizes: Vec<usize>,
}

impl BinTable {
    /// Builds the table for a segment geometry.
    ///
    /// `chunk_size` must be a power of two of at least 256 bytes.
    #[must_use]
    pub fn new(chunk_size: usize, max_segment_size: usize) -> Self {
        let limit = chunk_size / 2;
        let mut small_sizes = Vec::new();

        let mut size = MIN_BIN_SIZE;
        while size <= LINEAR_LIMIT.min(limit) {
            small_sizes.push(size);
            size += MIN_BIN_SIZE;
        }

        let mut base = LINEAR_LIMIT;
        'outer: while base < limit {
            let step = base / STEPS_PER_DOUBLING;
            for i in 1..=STEPS_PER_DOUBLING {
                let size = base + i * step;
                if size > limit {
                    break 'outer;
                }
                small_sizes.push(size);
            }
            base *= 2;
        }

        Self {
            chunk_size,
            max_chunks: max_segment_size / chunk_size,
            small_sizes,
        }
    }

    /// Returns the chunk size the table was built for.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the number of small bins.
    #[must_use]
    pub fn small_bin_count(&self) -> usize {
        self.small_sizes.len()
    }

    /// Returns the total number of bins, small and large.
    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.small_sizes.len() + self.max_chunks
    }

    /// Returns the largest size served from a small bin.
    #[must_use]
    pub fn max_small_size(&self) -> usize {
        self.small_sizes.last().copied().unwrap_or(0)
    }

    /// Returns true if `bin` is a small bin.
    #[must_use]
    pub fn is_small(&self, bin: BinIndex) -> bool {
        bin < self.small_sizes.len()
    }

    /// Returns the smallest bin that holds `size` bytes.
    ///
    /// Returns `None` for zero or for sizes beyond the maximum segment size.
    #[must_use]
    pub fn bin_of(&self, size: usize) -> Option<BinIndex> {
        if size == 0 {
            return None;
        }
        if size <= self.max_small_size() {
            return Some(self.small_sizes.partition_point(|&s| s < size));
        }
        let chunks = size.div_ceil(self.chunk_size);
        (chunks <= self.max_chunks).then(|| self.small_sizes.len() + chunks - 1)
    }

    /// Returns the smallest bin that holds `size` bytes at an address that
    /// is a multiple of `align`.
    ///
    /// `align` must be a power of two no larger than the chunk size.
    #[must_use]
    pub fn bin_for(&self, size: usize, align: usize) -> Option<BinIndex> {
        if !align.is_power_of_two() || align > self.chunk_size {
            return None;
        }
        let mut bin = self.bin_of(size)?;
        while self.is_small(bin) && self.size_of(bin) % align != 0 {
            bin += 1;
        }
        Some(bin)
    }

    /// Returns the block size of `bin`.
    #[must_use]
    pub fn size_of(&self, bin: BinIndex) -> usize {
        match self.small_sizes.get(bin) {
            Some(&size) => size,
            None => self.chunks_of(bin) * self.chunk_size,
        }
    }

    /// Returns how many chunks an object in large bin `bin` spans.
    #[must_use]
    pub fn chunks_of(&self, bin: BinIndex) -> usize {
        bin.saturating_sub(self.small_sizes.len()) + 1
    }

    /// Returns how many blocks of small bin `bin` fit in one chunk.
    #[must_use]
    pub fn slots_per_chunk(&self, bin: BinIndex) -> usize {
        self.chunk_size / self.size_of(bin)
    }

    /// Returns how many blocks of `bin` are carved from a chunk at once.
    #[must_use]
    pub fn carve_batch(&self, bin: BinIndex) -> usize {
        (4096 / self.size_of(bin)).clamp(1, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CHUNK: usize = 1 << 21;

    fn table() -> BinTable {
        BinTable::new(CHUNK, 1 << 30)
    }

    #[test]
    fn small_progression() {
        let t = table();
        let sizes: Vec<_> = (0..16).map(|b| t.size_of(b)).collect();
        assert_eq!(
            sizes,
            [16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512]
        );
        assert_eq!(t.max_small_size(), CHUNK / 2);
        assert!(t.small_sizes.iter().all(|s| s % MIN_BIN_SIZE == 0));
    }

    #[test]
    fn rounding() {
        let t = table();
        assert_eq!(t.bin_of(0), None);
        assert_eq!(t.size_of(t.bin_of(1).unwrap()), 16);
        assert_eq!(t.size_of(t.bin_of(16).unwrap()), 16);
        assert_eq!(t.size_of(t.bin_of(17).unwrap()), 32);
        assert_eq!(t.size_of(t.bin_of(129).unwrap()), 160);
        assert_eq!(t.size_of(t.bin_of(1000).unwrap()), 1024);
    }

    #[test]
    fn large_bins_are_chunk_multiples() {
        let t = table();
        let one = t.bin_of(CHUNK / 2 + 1).unwrap();
        assert!(!t.is_small(one));
        assert_eq!(t.size_of(one), CHUNK);
        assert_eq!(t.chunks_of(one), 1);

        let three = t.bin_of(2 * CHUNK + 1).unwrap();
        assert_eq!(t.chunks_of(three), 3);
        assert_eq!(t.size_of(three), 3 * CHUNK);
    }

    #[test]
    fn bin_count_covers_max_segment() {
        let t = table();
        assert_eq!(t.bin_count(), t.small_bin_count() + 512);
        assert_eq!(t.bin_of(1 << 30), Some(t.bin_count() - 1));
        assert_eq!(t.bin_of((1 << 30) + 1), None);
    }

    #[test]
    fn alignment_moves_to_multiple_bin() {
        let t = table();
        let bin = t.bin_for(80, 64).unwrap();
        assert_eq!(t.size_of(bin) % 64, 0);
        assert!(t.size_of(bin) >= 80);
        assert_eq!(t.bin_for(8, 3), None);
        assert_eq!(t.bin_for(8, CHUNK * 2), None);
    }

    #[test]
    fn carve_batch_bounds() {
        let t = table();
        assert_eq!(t.carve_batch(0), 64);
        assert_eq!(t.carve_batch(t.bin_of(4096).unwrap()), 1);
        assert_eq!(t.carve_batch(t.bin_of(CHUNK / 2).unwrap()), 1);
    }

    #[test]
    fn small_chunk_geometry() {
        let t = BinTable::new(1 << 16, 1 << 20);
        assert_eq!(t.max_small_size(), 1 << 15);
        assert_eq!(t.bin_count(), t.small_bin_count() + 16);
    }

    proptest! {
        #[test]
        fn bin_monotonic(a in 1usize..(4 * CHUNK), b in 1usize..(4 * CHUNK)) {
            let t = table();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(t.size_of(t.bin_of(lo).unwrap()) <= t.size_of(t.bin_of(hi).unwrap()));
        }

        #[test]
        fn bin_holds_request(size in 1usize..(4 * CHUNK)) {
            let t = table();
            let bin = t.bin_of(size).unwrap();
            prop_assert!(t.size_of(bin) >= size);
            if bin > 0 && t.is_small(bin) {
                prop_assert!(t.size_of(bin - 1) < size);
            }
        }

        #[test]
        fn small_waste_bounded(size in 1usize..=(CHUNK / 2)) {
            let t = table();
            let waste = t.size_of(t.bin_of(size).unwrap()) - size;
            prop_assert!(waste < MIN_BIN_SIZE.max(size / 4));
        }
    }
}
