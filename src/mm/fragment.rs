use alloc::vec::Vec;
use core::ops::Range;

use crate::arch::PAGE_SIZE;
use crate::config::{ColoredRegionCfg, MemFlags};

use super::color::{color_ranges, CacheColoring};

/// One contiguous physical-virtual slice of a colored region; the unit of
/// every map/unmap/flush operation. Fragments are produced on the fly and
/// consumed within a single operation, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub phys: usize,
    pub virt: usize,
    pub size: usize,
    pub flags: MemFlags,
}

impl Fragment {
    /// A plain single-piece fragment covering an ordinary region.
    pub fn plain(phys: usize, virt: usize, size: usize, flags: MemFlags) -> Self {
        Self {
            phys,
            virt,
            size,
            flags,
        }
    }

    /// The same slice at a shifted virtual base (loader and HV mappings).
    pub fn rebase_virt(&self, offset: usize) -> Self {
        Self {
            virt: self.virt + offset,
            ..*self
        }
    }
}

/// Expand a colored region into fragments, in ascending virtual order.
///
/// For stride `r` and color run `[i, j)` the fragment covers
/// `phys_start + i * PAGE_SIZE + r * way_size` for `(j - i)` pages, plus the
/// region's `rebase_offset`. The virtual cursor advances by each fragment's
/// size, so the guest sees one contiguous region backed by a color-restricted
/// physical striping.
pub fn fragments(cache: &CacheColoring, region: &ColoredRegionCfg) -> FragmentIter {
    let ranges: Vec<Range<usize>> = color_ranges(region.colors & cache.bitmap_mask()).collect();
    FragmentIter {
        ranges,
        range_idx: 0,
        stride: 0,
        way_size: cache.way_size(),
        phys_base: region.phys_start.wrapping_add(region.rebase_offset),
        virt_cursor: region.virt_start,
        virt_end: region.virt_start + region.size,
        flags: region.flags,
    }
}

pub struct FragmentIter {
    ranges: Vec<Range<usize>>,
    range_idx: usize,
    stride: usize,
    way_size: usize,
    phys_base: usize,
    virt_cursor: usize,
    virt_end: usize,
    flags: MemFlags,
}

impl Iterator for FragmentIter {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.ranges.is_empty() || self.virt_cursor >= self.virt_end {
            return None;
        }
        let range = &self.ranges[self.range_idx];
        let size = (range.len() * PAGE_SIZE).min(self.virt_end - self.virt_cursor);
        let frag = Fragment {
            phys: self.phys_base + range.start * PAGE_SIZE + self.stride * self.way_size,
            virt: self.virt_cursor,
            size,
            flags: self.flags,
        };
        self.virt_cursor += size;
        self.range_idx += 1;
        if self.range_idx == self.ranges.len() {
            self.range_idx = 0;
            self.stride += 1;
        }
        Some(frag)
    }
}
