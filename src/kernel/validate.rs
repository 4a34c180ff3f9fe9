use crate::arch::{PAGE_MASK, PAGE_SIZE};
use crate::config::{CellConfig, ColoredRegionCfg, MemFlags, MemRegionCfg};
use crate::mm::CacheColoring;
use crate::util::is_aligned;

use super::coloring::{Coloring, RootColorRegion};
use super::Error;

/// Pre-activation checks for a non-root cell descriptor.
///
/// Managed regions additionally get their `phys_start` filled in with the
/// root pool base, and their color bitmaps checked against the claim ledger
/// so two managed cells cannot stripe over the same frames.
pub fn validate_cell_config(ctx: &Coloring, config: &mut CellConfig) -> Result<(), Error> {
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let cache = ctx.cache();
    if !cache.is_enabled() {
        error!(
            "cell {}: colored regions declared but no unified cache is present",
            config.name
        );
        return Err(Error::ConfigInvalid);
    }
    let claimed = ctx.claimed_colors();

    for region in config.colored_regions.iter_mut() {
        check_region(cache, region)?;
        if region.is_managed() {
            let pool = ctx.root_region().ok_or_else(|| {
                error!("cell {}: managed colored region without a root pool", config.name);
                Error::ConfigInvalid
            })?;
            if region.colors & claimed != 0 {
                error!(
                    "cell {}: colors {:#x} overlap already-claimed {:#x}",
                    config.name, region.colors, claimed
                );
                return Err(Error::ConfigInvalid);
            }
            let end = simulate_coloring(cache, pool.base, region.size, region.colors);
            if end > pool.end() {
                error!(
                    "cell {}: managed walk ends at {:#x}, past the pool end {:#x}",
                    config.name,
                    end,
                    pool.end()
                );
                return Err(Error::OutOfBounds);
            }
            region.phys_start = pool.base;
        } else {
            if !is_aligned(region.phys_start, cache.way_size()) {
                error!(
                    "cell {}: manual colored base {:#x} not way-aligned",
                    config.name, region.phys_start
                );
                return Err(Error::ConfigInvalid);
            }
            let end = simulate_coloring(cache, region.phys_start, region.size, region.colors);
            if let Some(pool) = ctx.root_region() {
                if end > pool.base && region.phys_start < pool.end() {
                    error!(
                        "cell {}: manual colored extent {:#x}..{:#x} overlaps the root pool",
                        config.name, region.phys_start, end
                    );
                    return Err(Error::OutOfBounds);
                }
            }
        }
    }
    Ok(())
}

/// Normalize the root descriptor at enable time and extract the single root
/// pool, if one is declared.
///
/// Managed coloring is not supported on the root: such regions lose their
/// coloring silently and continue life as ordinary regions.
pub(crate) fn validate_root_config(
    cache: &CacheColoring,
    config: &mut CellConfig,
) -> Result<Option<RootColorRegion>, Error> {
    let mut keep = alloc::vec::Vec::new();
    for region in config.colored_regions.drain(..) {
        if region.is_managed() {
            warn!(
                "root cell: managed coloring at {:#x} ignored, region demoted",
                region.virt_start
            );
            config.mem_regions.push(MemRegionCfg {
                phys_start: region.phys_start,
                virt_start: region.virt_start,
                size: region.size,
                flags: region
                    .flags
                    .without(MemFlags::COLORED_CELL)
                    .without(MemFlags::COLORED),
            });
        } else {
            keep.push(region);
        }
    }
    config.colored_regions = keep;

    if config.colored_regions.is_empty() {
        return Ok(None);
    }
    if !cache.is_enabled() {
        error!("root cell declares colored regions but no unified cache is present");
        return Err(Error::ConfigInvalid);
    }

    let mut pool = None;
    for region in &config.colored_regions {
        check_region(cache, region)?;
        if !is_aligned(region.phys_start, cache.way_size()) {
            error!("root colored base {:#x} not way-aligned", region.phys_start);
            return Err(Error::ConfigInvalid);
        }
        if region.flags.contains(MemFlags::COLORED) {
            if pool.is_some() {
                error!("more than one root colored pool declared");
                return Err(Error::ConfigInvalid);
            }
            pool = Some(RootColorRegion {
                base: region.phys_start,
                size: region.size,
                colors: region.colors,
            });
        }
    }
    Ok(pool)
}

fn check_region(cache: &CacheColoring, region: &ColoredRegionCfg) -> Result<(), Error> {
    if region.colors == 0 || region.colors & !cache.bitmap_mask() != 0 {
        error!(
            "colors {:#x} out of range for {} cache colors",
            region.colors,
            cache.color_count()
        );
        return Err(Error::ConfigInvalid);
    }
    if region.size == 0 || region.size & PAGE_MASK != 0 {
        error!("colored region size {:#x} is not a page multiple", region.size);
        return Err(Error::ConfigInvalid);
    }
    Ok(())
}

/// Walk `next_colored` page by page without installing anything, purely to
/// learn the highest physical address a colored expansion would reach.
pub(crate) fn simulate_coloring(
    cache: &CacheColoring,
    base: usize,
    size: usize,
    colors: u64,
) -> usize {
    let mut pa = base;
    let mut end = base;
    for _ in 0..size / PAGE_SIZE {
        pa = cache.next_colored(pa, colors);
        end = pa + PAGE_SIZE;
        pa = end;
    }
    end
}
