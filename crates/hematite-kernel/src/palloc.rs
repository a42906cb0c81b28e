//! Physical page allocator.
//!
//! Hands out 4 KiB frames from the half-open range `[heap_start, heap_end)`
//! configured at boot. A LIFO free list; freed pages go back on the list,
//! allocator metadata itself is never reclaimed.

use crate::layout::PAGE_SIZE;
use hematite_vm::PhysAddr;
use log::info;

pub struct FrameAllocator {
    free: Vec<PhysAddr>,
    total: usize,
}

impl FrameAllocator {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            total: 0,
        }
    }

    /// Seed the free list from `[heap_start, heap_end)`, rounded inward to
    /// page boundaries. Pushed in descending order so the first `kalloc`
    /// returns the lowest page.
    pub fn init(&mut self, heap_start: u64, heap_end: u64) {
        let start = (heap_start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = heap_end & !(PAGE_SIZE - 1);
        let mut page = end;
        while page > start {
            page -= PAGE_SIZE;
            self.free.push(PhysAddr::new(page));
        }
        self.total = self.free.len();
        info!(
            "palloc: {} pages in [{:#x}, {:#x})",
            self.total, start, end
        );
    }

    pub fn kalloc(&mut self) -> Option<PhysAddr> {
        self.free.pop()
    }

    pub fn kfree(&mut self, page: PhysAddr) {
        debug_assert!(page.is_page_aligned());
        self.free.push(page);
    }

    pub fn free_pages(&self) -> usize {
        self.free.len()
    }

    pub fn total_pages(&self) -> usize {
        self.total
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn small_allocator() -> FrameAllocator {
        let mut palloc = FrameAllocator::new();
        palloc.init(0x8080_0000, 0x8080_0000 + 8 * PAGE_SIZE);
        palloc
    }

    #[test]
    fn pages_are_aligned_and_distinct() {
        let mut palloc = small_allocator();
        let mut seen = HashSet::new();
        while let Some(page) = palloc.kalloc() {
            assert!(page.is_page_aligned());
            assert!(seen.insert(page.val()));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut palloc = small_allocator();
        for _ in 0..8 {
            assert!(palloc.kalloc().is_some());
        }
        assert!(palloc.kalloc().is_none());
        // a free makes exactly one page available again
        palloc.kfree(PhysAddr::new(0x8080_0000));
        assert!(palloc.kalloc().is_some());
        assert!(palloc.kalloc().is_none());
    }

    #[test]
    fn unaligned_range_is_rounded_inward() {
        let mut palloc = FrameAllocator::new();
        palloc.init(0x8080_0010, 0x8080_0010 + 3 * PAGE_SIZE);
        // first usable page starts at the next boundary
        assert_eq!(palloc.total_pages(), 2);
        assert_eq!(palloc.kalloc().unwrap().val(), 0x8080_1000);
    }

    proptest! {
        // alloc/free in any order preserves the free-set partition
        #[test]
        fn partition_is_preserved(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut palloc = small_allocator();
            let mut held = Vec::new();
            for alloc in ops {
                if alloc {
                    if let Some(p) = palloc.kalloc() {
                        held.push(p);
                    }
                } else if let Some(p) = held.pop() {
                    palloc.kfree(p);
                }
                prop_assert_eq!(palloc.free_pages() + held.len(), 8);
            }
            let unique: HashSet<u64> = held.iter().map(|p| p.val()).collect();
            prop_assert_eq!(unique.len(), held.len());
        }
    }
}
