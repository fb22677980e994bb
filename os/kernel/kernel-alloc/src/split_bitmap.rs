//! Per-order buddy-pair bitmap.
//!
//! One bit per buddy *pair* per order below the zone's maximum order. The bit
//! is toggled every time one half of the pair enters or leaves the free list
//! of that order, so it holds `free(lower) XOR free(upper)`:
//!
//! ```text
//! order 1:  [ pair 0        ][ pair 1        ]
//! order 0:  [ p0  ][ p1    ][ p2  ][ p3     ]
//! frames:    0  1   2  3     4  5   6  7
//! ```
//!
//! While freeing a block that is not itself on a free list, a set bit
//! therefore means "the buddy is free, merge".

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

pub(crate) struct SplitBitmap {
    /// `orders[k]` holds the pair bits for blocks of order `k`.
    orders: Vec<Vec<u64>>,
}

impl SplitBitmap {
    /// Bitmap covering `frame_count` frames with pair bits for orders `0..max_order`.
    pub(crate) fn new(frame_count: usize, max_order: u8) -> Self {
        let orders = (0..max_order)
            .map(|order| {
                let pair_frames = 1usize << (order + 1);
                let pairs = frame_count.div_ceil(pair_frames);
                vec![0u64; pairs.div_ceil(WORD_BITS)]
            })
            .collect();
        Self { orders }
    }

    #[inline]
    const fn locate(order: u8, block_index: usize) -> (usize, u64) {
        let pair = block_index >> (order + 1);
        (pair / WORD_BITS, 1u64 << (pair % WORD_BITS))
    }

    /// Flip the pair bit of the block starting at frame `block_index`.
    ///
    /// Returns the new value of the bit.
    pub(crate) fn toggle(&mut self, order: u8, block_index: usize) -> bool {
        let (word, mask) = Self::locate(order, block_index);
        let slot = &mut self.orders[usize::from(order)][word];
        *slot ^= mask;
        *slot & mask != 0
    }

    pub(crate) fn is_set(&self, order: u8, block_index: usize) -> bool {
        let (word, mask) = Self::locate(order, block_index);
        self.orders[usize::from(order)][word] & mask != 0
    }

    /// Whether orders below the zone maximum are tracked for `order`.
    pub(crate) fn tracks(&self, order: u8) -> bool {
        usize::from(order) < self.orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_halves_share_one_bit() {
        let mut bits = SplitBitmap::new(16, 4);
        assert!(bits.toggle(1, 4));
        assert!(bits.is_set(1, 6));
        assert!(!bits.toggle(1, 6));
        assert!(!bits.is_set(1, 4));
    }

    #[test]
    fn orders_are_independent() {
        let mut bits = SplitBitmap::new(16, 4);
        bits.toggle(0, 0);
        assert!(bits.is_set(0, 1));
        assert!(!bits.is_set(1, 0));
        assert!(!bits.is_set(2, 0));
    }

    #[test]
    fn covers_more_than_one_word() {
        let mut bits = SplitBitmap::new(1024, 3);
        assert!(bits.toggle(0, 1022));
        assert!(bits.is_set(0, 1023));
        assert!(!bits.is_set(0, 1020));
    }

    #[test]
    fn max_order_is_untracked() {
        let bits = SplitBitmap::new(16, 4);
        assert!(bits.tracks(3));
        assert!(!bits.tracks(4));
    }
}
