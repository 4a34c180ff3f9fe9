use crate::arch::FlushKind;
use crate::config::ColoredRegionCfg;
use crate::mm::{CacheColoring, Fragment};

use super::coloring::{apply_region, init_coloring, ColoringHooks, RegionOp};
use super::recolor::recolor_region;
use super::validate::validate_root_config;
use super::{coloring, Cell, Coloring, Error};

/// Lifecycle of a colored region, advanced by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Declared,
    Mapped,
    Loaded,
    Running,
}

/// Parks every other CPU for the lifetime of the guard; no page-table or
/// SMMU change happens outside one.
struct StopTheWorld<'a, H: ColoringHooks + ?Sized> {
    hooks: &'a H,
}

impl<'a, H: ColoringHooks + ?Sized> StopTheWorld<'a, H> {
    fn enter(hooks: &'a H) -> Self {
        hooks.park_other_cpus();
        Self { hooks }
    }
}

impl<H: ColoringHooks + ?Sized> Drop for StopTheWorld<'_, H> {
    fn drop(&mut self) {
        self.hooks.release_cpus();
    }
}

/// Map every colored region of `cell`, stealing the frames from the root.
///
/// Fail-fast: the first failing region aborts, and everything already mapped
/// (including the half-applied region) is destroyed again before returning.
pub fn colored_cell_create<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
) -> Result<(), Error> {
    let config = cell.config();
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let _stw = StopTheWorld::enter(hooks);
    let smmu = config.has_stream_ids();

    for (idx, region) in config.colored_regions.iter().enumerate() {
        let mapped = apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::Create)
            .and_then(|_| {
                if smmu {
                    apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::SmmuCreate)
                } else {
                    Ok(())
                }
            });
        if let Err(err) = mapped {
            error!(
                "cell {}: create of colored region {} failed: {}",
                cell.id(),
                idx,
                err
            );
            destroy_regions(hooks, ctx, root, cell, &config.colored_regions[..=idx], smmu);
            return Err(err);
        }
        cell.set_region_state(idx, RegionState::Mapped);
    }

    for region in &config.colored_regions {
        if region.is_managed() {
            ctx.claim(region.colors);
        }
    }
    Ok(())
}

/// Unmap every colored region and hand the frames back to the root. Never
/// aborts: shutdown must always make forward progress.
pub fn colored_cell_destroy<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
) {
    let config = cell.config();
    if config.colored_regions.is_empty() {
        return;
    }
    let _stw = StopTheWorld::enter(hooks);
    destroy_regions(
        hooks,
        ctx,
        root,
        cell,
        &config.colored_regions,
        config.has_stream_ids(),
    );
    for region in &config.colored_regions {
        if region.is_managed() {
            ctx.release(region.colors);
        }
    }
}

fn destroy_regions<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
    regions: &[ColoredRegionCfg],
    smmu: bool,
) {
    for (idx, region) in regions.iter().enumerate() {
        if smmu {
            let _ = apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::SmmuDestroy);
        }
        let _ = apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::Destroy);
        cell.set_region_state(idx, RegionState::Declared);
    }
}

/// Install the loader mappings: the root gains write access to every
/// loadable fragment at `virt + ROOT_MAP_OFFSET` so it can place the image.
pub fn colored_cell_load<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
) -> Result<(), Error> {
    let config = cell.config();
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let _stw = StopTheWorld::enter(hooks);
    for (idx, region) in config.colored_regions.iter().enumerate() {
        if let Err(err) = apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::Load) {
            for done in config.colored_regions.iter().take(idx + 1) {
                let _ = apply_region(hooks, ctx.cache(), root, cell, done, RegionOp::Start);
            }
            return Err(err);
        }
        if region.flags.is_loadable() {
            cell.set_region_state(idx, RegionState::Loaded);
        }
    }
    Ok(())
}

/// Tear the loader mappings down and flush the image out of the D-cache,
/// in that order, before the cell's CPUs are released.
pub fn colored_cell_start<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
) -> Result<(), Error> {
    let config = cell.config();
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let _stw = StopTheWorld::enter(hooks);
    for (idx, region) in config.colored_regions.iter().enumerate() {
        apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::Start)?;
        apply_region(
            hooks,
            ctx.cache(),
            root,
            cell,
            region,
            RegionOp::Flush(FlushKind::CleanAndInvalidate),
        )?;
        cell.set_region_state(idx, RegionState::Running);
    }
    Ok(())
}

/// Cache maintenance over every colored region of the cell.
pub fn colored_cell_flush<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    cell: &Cell,
    kind: FlushKind,
) -> Result<(), Error> {
    let config = cell.config();
    let _stw = StopTheWorld::enter(hooks);
    for region in &config.colored_regions {
        apply_region(hooks, ctx.cache(), root, cell, region, RegionOp::Flush(kind))?;
    }
    Ok(())
}

/// Bring the subsystem up at hypervisor enable: normalize the root
/// descriptor, publish the global record, recolor the root's RAM in place
/// and swap its stage-2 onto the colored striping. A failure reverts the
/// root to its identity layout before returning.
pub fn coloring_enable<H: ColoringHooks + ?Sized>(
    hooks: &H,
    cache: CacheColoring,
    root: &Cell,
) -> Result<&'static Coloring, Error> {
    let mut config = root.config();
    let root_region = validate_root_config(&cache, &mut config)?;
    root.set_config(config);
    let ctx = init_coloring(Coloring::new(cache, root_region));
    enable_with(hooks, ctx, root)?;
    info!(
        "cache coloring enabled: {} colors, way size {:#x}",
        ctx.cache().color_count(),
        ctx.cache().way_size()
    );
    Ok(ctx)
}

/// Shut the subsystem down: copy the root's RAM back to its identity layout
/// and restore the identity stage-2 mapping.
pub fn coloring_disable<H: ColoringHooks + ?Sized>(hooks: &H, root: &Cell) -> Result<(), Error> {
    let ctx = coloring().ok_or(Error::ConfigInvalid)?;
    disable_with(hooks, ctx, root)
}

pub(crate) fn enable_with<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
) -> Result<(), Error> {
    let config = root.config();
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let _stw = StopTheWorld::enter(hooks);

    let mut recolored = 0;
    let mut swapped = 0;
    let result = enable_regions(hooks, ctx, root, &config.colored_regions, &mut recolored, &mut swapped);
    if result.is_err() {
        warn!("hypervisor enable failed, restoring the root's identity layout");
        for idx in (0..swapped).rev() {
            swap_to_identity(hooks, ctx, root, &config.colored_regions[idx]);
            root.set_region_state(idx, RegionState::Declared);
        }
        for idx in (0..recolored).rev() {
            let _ = recolor_region(hooks, ctx.cache(), root, &config.colored_regions[idx], true);
        }
    }
    result
}

fn enable_regions<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    regions: &[ColoredRegionCfg],
    recolored: &mut usize,
    swapped: &mut usize,
) -> Result<(), Error> {
    for region in regions {
        recolor_region(hooks, ctx.cache(), root, region, false)?;
        *recolored += 1;
    }
    for (idx, region) in regions.iter().enumerate() {
        swap_to_colored(hooks, ctx, root, region)?;
        root.set_region_state(idx, RegionState::Mapped);
        *swapped += 1;
    }
    Ok(())
}

pub(crate) fn disable_with<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
) -> Result<(), Error> {
    let config = root.config();
    if config.colored_regions.is_empty() {
        return Ok(());
    }
    let _stw = StopTheWorld::enter(hooks);
    for (idx, region) in config.colored_regions.iter().enumerate() {
        recolor_region(hooks, ctx.cache(), root, region, true)?;
        swap_to_identity(hooks, ctx, root, region);
        root.set_region_state(idx, RegionState::Declared);
    }
    Ok(())
}

/// Replace the root's identity stage-2 mapping of the region with the
/// colored striping.
fn swap_to_colored<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    region: &ColoredRegionCfg,
) -> Result<(), Error> {
    hooks.unmap(root, &identity_fragment(region))?;
    apply_region(hooks, ctx.cache(), root, root, region, RegionOp::Create)
}

fn swap_to_identity<H: ColoringHooks + ?Sized>(
    hooks: &H,
    ctx: &Coloring,
    root: &Cell,
    region: &ColoredRegionCfg,
) {
    let _ = apply_region(hooks, ctx.cache(), root, root, region, RegionOp::Destroy);
    if let Err(err) = hooks.map(root, &identity_fragment(region)) {
        warn!("root identity mapping at {:#x} not restored: {}", region.virt_start, err);
    }
}

fn identity_fragment(region: &ColoredRegionCfg) -> Fragment {
    Fragment::plain(region.phys_start, region.virt_start, region.size, region.flags)
}
