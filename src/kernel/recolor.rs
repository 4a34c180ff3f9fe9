use crate::arch::{NUM_TEMPORARY_PAGES, PAGE_SIZE, ROOT_MAP_OFFSET};
use crate::config::{ColoredRegionCfg, MemFlags};
use crate::mm::CacheColoring;

use super::coloring::{apply_region, ColoringHooks, RegionOp};
use super::{Cell, Error};

/// Move one root-cell region between its natural identity layout and the
/// color-restricted striping, in place, preserving every byte the guest can
/// see.
///
/// The hypervisor's own table exposes both arrangements at once: a linear
/// colored mapping at `virt_start + ROOT_MAP_OFFSET` and a sliding temporary
/// window over the identity range. The running root never participates.
pub(crate) fn recolor_region<H: ColoringHooks + ?Sized>(
    hooks: &H,
    cache: &CacheColoring,
    root: &Cell,
    region: &ColoredRegionCfg,
    uncolor: bool,
) -> Result<(), Error> {
    info!(
        "{} root region at {:#x} ({:#x} bytes, colors {:#x})",
        if uncolor { "uncoloring" } else { "coloring" },
        region.phys_start,
        region.size,
        region.colors
    );
    apply_region(hooks, cache, root, root, region, RegionOp::HvCreate)?;
    let copied = if uncolor {
        copy_out(hooks, region)
    } else {
        copy_in(hooks, region)
    };
    let destroyed = apply_region(hooks, cache, root, root, region, RegionOp::HvDestroy);
    copied.and(destroyed)
}

/// Identity layout to colored striping, at hypervisor enable.
///
/// Every colored frame sits at or above the identity frame it receives, and
/// the two ranges overlap, so both the slice loop and the page loop run
/// backwards: a forward pass would overwrite source pages it has not read
/// yet.
fn copy_in<H: ColoringHooks + ?Sized>(
    hooks: &H,
    region: &ColoredRegionCfg,
) -> Result<(), Error> {
    let colored_va = region.virt_start + ROOT_MAP_OFFSET;
    let window = hooks.temp_map_base();
    let window_size = NUM_TEMPORARY_PAGES * PAGE_SIZE;
    let slices = (region.size + window_size - 1) / window_size;

    for slice in (0..slices).rev() {
        let offset = slice * window_size;
        let len = window_size.min(region.size - offset);
        hooks.hv_map(
            region.phys_start + offset,
            window,
            len,
            MemFlags::READ | MemFlags::WRITE,
        )?;
        for page in (0..len / PAGE_SIZE).rev() {
            hooks.copy_mem(
                colored_va + offset + page * PAGE_SIZE,
                window + page * PAGE_SIZE,
                PAGE_SIZE,
            );
        }
        hooks.hv_unmap(window, len)?;
    }
    Ok(())
}

/// Colored striping back to the identity layout, at shutdown. The mirror of
/// [`copy_in`]: destinations sit at or below their sources, so both loops run
/// forwards.
fn copy_out<H: ColoringHooks + ?Sized>(
    hooks: &H,
    region: &ColoredRegionCfg,
) -> Result<(), Error> {
    let colored_va = region.virt_start + ROOT_MAP_OFFSET;
    let window = hooks.temp_map_base();
    let window_size = NUM_TEMPORARY_PAGES * PAGE_SIZE;
    let slices = (region.size + window_size - 1) / window_size;

    for slice in 0..slices {
        let offset = slice * window_size;
        let len = window_size.min(region.size - offset);
        hooks.hv_map(
            region.phys_start + offset,
            window,
            len,
            MemFlags::READ | MemFlags::WRITE,
        )?;
        for page in 0..len / PAGE_SIZE {
            hooks.copy_mem(
                window + page * PAGE_SIZE,
                colored_va + offset + page * PAGE_SIZE,
                PAGE_SIZE,
            );
        }
        hooks.hv_unmap(window, len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::MockHooks;
    use super::*;
    use crate::config::CellConfig;
    use crate::mm::fragments;
    use alloc::string::String;
    use alloc::vec::Vec;

    fn l2_64k() -> CacheColoring {
        CacheColoring::new(1024, 16, 64)
    }

    fn root_cell() -> Cell {
        Cell::new(0, CellConfig::new(String::from("root")))
    }

    // colors 2..=15 of 16: the colored striping overlaps the identity range,
    // which is exactly what makes the copy order matter
    fn overlap_region() -> ColoredRegionCfg {
        ColoredRegionCfg {
            phys_start: 0,
            virt_start: 0,
            size: 0x20000,
            flags: MemFlags::READ | MemFlags::WRITE | MemFlags::COLORED,
            colors: 0xfffc,
            rebase_offset: 0,
        }
    }

    fn fill_identity(hooks: &MockHooks, region: &ColoredRegionCfg) {
        let mut state = hooks.state.lock();
        for page in 0..region.size / PAGE_SIZE {
            for byte in 0..PAGE_SIZE {
                state.mem[page * PAGE_SIZE + byte] = (page as u8) ^ (byte as u8);
            }
        }
    }

    fn colored_frames(cache: &CacheColoring, region: &ColoredRegionCfg) -> Vec<usize> {
        fragments(cache, region)
            .flat_map(|frag| (frag.phys..frag.phys + frag.size).step_by(PAGE_SIZE))
            .collect()
    }

    #[test]
    fn coloring_preserves_guest_visible_contents() {
        let cache = l2_64k();
        let region = overlap_region();
        let root = root_cell();
        let hooks = MockHooks::with_mem(0x30000);
        fill_identity(&hooks, &region);

        recolor_region(&hooks, &cache, &root, &region, false).unwrap();

        let state = hooks.snapshot();
        assert!(state.hv_maps.is_empty(), "all scratch mappings torn down");
        // the k-th guest page must now live in the k-th colored frame
        for (page, frame) in colored_frames(&cache, &region).into_iter().enumerate() {
            for byte in (0..PAGE_SIZE).step_by(257) {
                assert_eq!(
                    state.mem[frame + byte],
                    (page as u8) ^ (byte as u8),
                    "page {page} at frame {frame:#x}"
                );
            }
        }
    }

    #[test]
    fn uncoloring_restores_the_identity_layout() {
        let cache = l2_64k();
        let region = overlap_region();
        let root = root_cell();
        let hooks = MockHooks::with_mem(0x30000);
        fill_identity(&hooks, &region);

        recolor_region(&hooks, &cache, &root, &region, false).unwrap();
        recolor_region(&hooks, &cache, &root, &region, true).unwrap();

        let state = hooks.snapshot();
        assert!(state.hv_maps.is_empty());
        for page in 0..region.size / PAGE_SIZE {
            for byte in (0..PAGE_SIZE).step_by(131) {
                assert_eq!(
                    state.mem[page * PAGE_SIZE + byte],
                    (page as u8) ^ (byte as u8),
                    "page {page}"
                );
            }
        }
    }

    #[test]
    fn full_color_set_degenerates_to_identity() {
        let cache = l2_64k();
        let mut region = overlap_region();
        region.colors = 0xffff;
        let root = root_cell();
        let hooks = MockHooks::with_mem(0x30000);
        fill_identity(&hooks, &region);

        recolor_region(&hooks, &cache, &root, &region, false).unwrap();

        let state = hooks.snapshot();
        for page in 0..region.size / PAGE_SIZE {
            assert_eq!(state.mem[page * PAGE_SIZE], page as u8);
        }
    }
}
