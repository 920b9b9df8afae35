//! Stack-frame slot allocation.
//!
//! The frame grows towards more-negative addresses below the frame pointer.
//! A slot is identified by its *end distance*: the slot for a value of size
//! `s` at distance `d` occupies the bytes `[fp - d, fp - d + s)`, so the
//! frame-pointer-relative offset of the slot base is `-(d as i32)`.
//!
//! Slot sizes up to 16 bytes are rounded to the next power of two and served
//! from per-size free lists; larger sizes are rounded up to a multiple of 16
//! and recycled through a size-keyed map. When a request needs alignment `k`,
//! the current frame tail is padded up to `k` and the padding bytes are
//! pushed onto the smaller free lists instead of being lost.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Sentinel distance handed out for zero-sized requests.
const ZERO_SIZE_SLOT: u32 = 1;

/// Size-bucketed allocator over a downward-growing frame.
pub struct FrameAlloc {
    /// Current frame size in bytes, not counting the final 16-alignment.
    pub frame_size: u32,
    /// Free lists for slot sizes 1, 2, 4, 8 and 16.
    fixed_free_lists: [SmallVec<[u32; 16]>; 5],
    /// Free lists for larger sizes, keyed by the rounded size.
    dynamic_free_lists: FxHashMap<u32, Vec<u32>>,
}

impl FrameAlloc {
    pub fn new() -> Self {
        FrameAlloc {
            frame_size: 0,
            fixed_free_lists: Default::default(),
            dynamic_free_lists: FxHashMap::default(),
        }
    }

    /// Reset for a new function. `reserved` is the target's prologue
    /// reservation (callee-saved spill area) already counted into the frame.
    pub fn reset(&mut self, reserved: u32) {
        self.frame_size = reserved;
        for list in &mut self.fixed_free_lists {
            list.clear();
        }
        self.dynamic_free_lists.clear();
    }

    /// Allocate a slot of `size` bytes; returns the slot's end distance.
    pub fn allocate(&mut self, size: u32) -> u32 {
        let mut size = size;
        let align_bits;
        if size == 0 {
            return ZERO_SIZE_SLOT;
        } else if size <= 16 {
            let idx = size.next_power_of_two().trailing_zeros();
            size = 1 << idx;
            align_bits = idx;
            if let Some(slot) = self.fixed_free_lists[idx as usize].pop() {
                return slot;
            }
        } else {
            size = (size + 15) & !15;
            align_bits = 4;
            if let Some(slot) = self
                .dynamic_free_lists
                .get_mut(&size)
                .and_then(|list| list.pop())
            {
                return slot;
            }
        }

        // Pad the frame tail up to the requested alignment; the padding is
        // recycled through the smaller buckets.
        loop {
            let tail_align = self.frame_size.trailing_zeros().min(31);
            if self.frame_size != 0 && tail_align < align_bits {
                let pad = 1u32 << tail_align;
                self.frame_size += pad;
                self.fixed_free_lists[tail_align as usize].push(self.frame_size);
            } else {
                break;
            }
        }

        self.frame_size += size;
        self.frame_size
    }

    /// Return a slot to its free list.
    pub fn free(&mut self, slot: u32, size: u32) {
        if size == 0 {
            debug_assert_eq!(slot, ZERO_SIZE_SLOT);
        } else if size <= 16 {
            let idx = size.next_power_of_two().trailing_zeros();
            self.fixed_free_lists[idx as usize].push(slot);
        } else {
            let size = (size + 15) & !15;
            self.dynamic_free_lists.entry(size).or_default().push(slot);
        }
    }
}

impl Default for FrameAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_small_sizes_to_power_of_two() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        let a = f.allocate(3);
        assert_eq!(a, 4);
        let b = f.allocate(8);
        assert_eq!(b, 16);
        assert_eq!(f.frame_size, 16);
    }

    #[test]
    fn recycles_freed_slots() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        let a = f.allocate(8);
        f.free(a, 8);
        let b = f.allocate(8);
        assert_eq!(a, b);
        assert_eq!(f.frame_size, 8);
    }

    #[test]
    fn alignment_padding_feeds_small_buckets() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        let one = f.allocate(1);
        assert_eq!(one, 1);
        // The 16-byte request pads the frame from 1 to 16; the padding
        // becomes free 1/2/4/8 slots.
        let big = f.allocate(16);
        assert_eq!(big, 32);
        let pad1 = f.allocate(1);
        assert!(pad1 < 16);
        let pad8 = f.allocate(8);
        assert!(pad8 <= 16);
        assert_eq!(f.frame_size, 32);
    }

    #[test]
    fn large_slots_round_to_sixteen() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        let a = f.allocate(24);
        assert_eq!(a, 32);
        f.free(a, 24);
        assert_eq!(f.allocate(30), 32);
    }

    #[test]
    fn zero_sized_requests_share_a_sentinel() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        assert_eq!(f.allocate(0), f.allocate(0));
        assert_eq!(f.frame_size, 0);
    }

    #[test]
    fn live_slots_never_alias() {
        let mut f = FrameAlloc::new();
        f.reset(0);
        let mut live: Vec<(u32, u32)> = Vec::new();
        let sizes = [1u32, 2, 4, 8, 16, 24, 8, 4, 64, 16, 2, 1, 40];
        for (i, &size) in sizes.iter().enumerate() {
            let slot = f.allocate(size);
            let rounded = if size <= 16 {
                size.next_power_of_two()
            } else {
                (size + 15) & !15
            };
            for &(oslot, osize) in &live {
                let (a0, a1) = (slot - rounded, slot);
                let (b0, b1) = (oslot - osize, oslot);
                assert!(a1 <= b0 || b1 <= a0, "slots alias: {a0}..{a1} vs {b0}..{b1}");
            }
            live.push((slot, rounded));
            if i % 3 == 2 {
                let (slot, size) = live.remove(0);
                f.free(slot, size);
            }
        }
    }
}
