use spin::{Mutex, Once};

use crate::arch::{FlushKind, NUM_TEMPORARY_PAGES, PAGE_SIZE, ROOT_MAP_OFFSET};
use crate::config::{ColoredRegionCfg, MemFlags};
use crate::mm::{fragments, CacheColoring, Fragment};
use crate::util::memcpy_safe;

use super::{Cell, Error};

/// Policy for returning frames to the root cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemapMode {
    Abort,
    Warn,
}

/// Services the coloring core needs from the embedding hypervisor.
///
/// One implementation per backend; the stage-2, SMMU and root-cell tables are
/// owned by the implementor, keyed by the cell handed in. Map/unmap batches
/// must be visible (including TLB and SMMU invalidation) by the time
/// [`release_cpus`](Self::release_cpus) returns.
pub trait ColoringHooks {
    /// Insert a fragment into the cell's stage-2 table.
    fn map(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error>;

    /// Remove a fragment from the cell's stage-2 table.
    fn unmap(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error>;

    /// Register a sub-page MMIO fragment.
    fn subpage(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error>;

    /// Steal frames from the root cell; failure is fatal for the operation.
    fn unmap_from_root(&self, frag: &Fragment) -> Result<(), Error>;

    /// Return frames to the root cell.
    fn remap_to_root(&self, frag: &Fragment, mode: RemapMode) -> Result<(), Error>;

    /// Mirror of [`map`](Self::map) in the cell's SMMU table. Absent unless
    /// the backend registered an SMMU at boot.
    fn smmu_map(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
        let _ = (cell, frag);
        Err(Error::NotSupported)
    }

    fn smmu_unmap(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
        let _ = (cell, frag);
        Err(Error::NotSupported)
    }

    /// Raw insert into the hypervisor's own table; scratch windows and the
    /// recoloring engine's linear colored mapping go through here.
    fn hv_map(&self, phys: usize, virt: usize, size: usize, flags: MemFlags) -> Result<(), Error>;

    fn hv_unmap(&self, virt: usize, size: usize) -> Result<(), Error>;

    fn dcache_flush_by_va(&self, va: usize, size: usize, kind: FlushKind);

    /// Base of this CPU's preallocated temporary window,
    /// [`NUM_TEMPORARY_PAGES`] pages long and never shared across CPUs.
    fn temp_map_base(&self) -> usize;

    /// Stop-the-world barrier around page-table and SMMU changes.
    fn park_other_cpus(&self) {}

    fn release_cpus(&self) {}

    /// Copy between two mapped hypervisor virtual ranges.
    fn copy_mem(&self, dst: usize, src: usize, len: usize) {
        memcpy_safe(dst as *mut u8, src as *const u8, len);
    }
}

/// Per-fragment operation kind; the closed set the lifecycle dispatcher
/// drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionOp {
    /// Steal frames from the root and map them into the cell.
    Create,
    /// Unmap from the cell and hand frames back to the root, tolerating
    /// missing mappings.
    Destroy,
    /// Install the loader mapping so the root can write the inmate image.
    Load,
    /// Tear the loader mapping down again.
    Start,
    /// Cache maintenance over the region through the temporary window.
    Flush(FlushKind),
    /// Linear colored mapping for the hypervisor itself; recoloring only.
    HvCreate,
    HvDestroy,
    /// Mirror create/destroy in the cell's SMMU table.
    SmmuCreate,
    SmmuDestroy,
}

/// The single root-level colored pool: the physical window managed colored
/// allocations are drawn from, and the root's own colors within it.
#[derive(Clone, Copy, Debug)]
pub struct RootColorRegion {
    pub base: usize,
    pub size: usize,
    pub colors: u64,
}

impl RootColorRegion {
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Once-initialized record of everything global to the subsystem: the LLC
/// geometry, the root pool, and the ledger of managed color claims.
pub struct Coloring {
    cache: CacheColoring,
    root_region: Option<RootColorRegion>,
    managed_claims: Mutex<u64>,
}

impl Coloring {
    pub fn new(cache: CacheColoring, root_region: Option<RootColorRegion>) -> Self {
        let claims = root_region.as_ref().map_or(0, |region| region.colors);
        Self {
            cache,
            root_region,
            managed_claims: Mutex::new(claims),
        }
    }

    pub fn cache(&self) -> &CacheColoring {
        &self.cache
    }

    pub fn root_region(&self) -> Option<&RootColorRegion> {
        self.root_region.as_ref()
    }

    /// Colors currently owned by the root or a created managed cell.
    pub fn claimed_colors(&self) -> u64 {
        *self.managed_claims.lock()
    }

    pub(crate) fn claim(&self, colors: u64) {
        *self.managed_claims.lock() |= colors;
    }

    pub(crate) fn release(&self, colors: u64) {
        let root = self.root_region.as_ref().map_or(0, |region| region.colors);
        let mut claims = self.managed_claims.lock();
        *claims = (*claims & !colors) | root;
    }
}

static COLORING: Once<Coloring> = Once::new();

/// The global record, set once at hypervisor enable.
pub fn coloring() -> Option<&'static Coloring> {
    COLORING.get()
}

pub(crate) fn init_coloring(record: Coloring) -> &'static Coloring {
    COLORING.call_once(|| record)
}

/// Apply one operation to every fragment of a colored region, in ascending
/// virtual order. The first failing fragment aborts; there is no partial
/// rollback here — a half-applied create is cleaned up by running destroy
/// over the same region, which tolerates missing mappings.
pub fn apply_region<H: ColoringHooks + ?Sized>(
    hooks: &H,
    cache: &CacheColoring,
    root: &Cell,
    cell: &Cell,
    region: &ColoredRegionCfg,
    op: RegionOp,
) -> Result<(), Error> {
    trace!(
        "cell {}: {:?} over colored region at {:#x} ({:#x} bytes, colors {:#x})",
        cell.id(),
        op,
        region.virt_start,
        region.size,
        region.colors
    );
    for frag in fragments(cache, region) {
        apply_fragment(hooks, root, cell, &frag, op)?;
    }
    Ok(())
}

fn apply_fragment<H: ColoringHooks + ?Sized>(
    hooks: &H,
    root: &Cell,
    cell: &Cell,
    frag: &Fragment,
    op: RegionOp,
) -> Result<(), Error> {
    match op {
        RegionOp::Create => {
            // the root holds every free frame; steal them unless the region
            // stays visible there
            if !frag.flags.is_comm() && !frag.flags.is_root_shared() && !cell.is_root() {
                hooks.unmap_from_root(frag)?;
            }
            if frag.size < PAGE_SIZE {
                hooks.subpage(cell, frag)
            } else {
                hooks.map(cell, frag)
            }
        }
        RegionOp::Destroy => {
            if frag.size >= PAGE_SIZE {
                if let Err(err) = hooks.unmap(cell, frag) {
                    warn!("cell {}: unmap at {:#x} failed: {}", cell.id(), frag.virt, err);
                }
            }
            if !frag.flags.is_comm() && !frag.flags.is_root_shared() && !cell.is_root() {
                if let Err(err) = hooks.remap_to_root(frag, RemapMode::Warn) {
                    warn!("return of {:#x} to root failed: {}", frag.phys, err);
                }
            }
            Ok(())
        }
        RegionOp::Load => {
            if frag.flags.is_loadable() {
                let mut loader = frag.rebase_virt(ROOT_MAP_OFFSET);
                loader.flags = MemFlags::READ | MemFlags::WRITE;
                hooks.map(root, &loader)
            } else {
                Ok(())
            }
        }
        RegionOp::Start => {
            if frag.flags.is_loadable() {
                hooks.unmap(root, &frag.rebase_virt(ROOT_MAP_OFFSET))
            } else {
                Ok(())
            }
        }
        RegionOp::Flush(kind) => flush_fragment(hooks, frag, kind),
        RegionOp::HvCreate => hooks.hv_map(
            frag.phys,
            frag.virt + ROOT_MAP_OFFSET,
            frag.size,
            MemFlags::READ | MemFlags::WRITE,
        ),
        RegionOp::HvDestroy => hooks.hv_unmap(frag.virt + ROOT_MAP_OFFSET, frag.size),
        RegionOp::SmmuCreate => hooks.smmu_map(cell, frag),
        RegionOp::SmmuDestroy => {
            if let Err(err) = hooks.smmu_unmap(cell, frag) {
                warn!("cell {}: SMMU unmap at {:#x} failed: {}", cell.id(), frag.virt, err);
            }
            Ok(())
        }
    }
}

/// Cache maintenance by VA over a fragment that is not mapped in the
/// hypervisor: slide the temporary window across it, at most
/// `NUM_TEMPORARY_PAGES` pages per slice.
fn flush_fragment<H: ColoringHooks + ?Sized>(
    hooks: &H,
    frag: &Fragment,
    kind: FlushKind,
) -> Result<(), Error> {
    let window = hooks.temp_map_base();
    let window_size = NUM_TEMPORARY_PAGES * PAGE_SIZE;
    let mut offset = 0;
    while offset < frag.size {
        let len = window_size.min(frag.size - offset);
        hooks.hv_map(frag.phys + offset, window, len, MemFlags::READ | MemFlags::WRITE)?;
        hooks.dcache_flush_by_va(window, len, kind);
        hooks.hv_unmap(window, len)?;
        offset += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{MockHooks, TEMP_BASE};
    use super::*;
    use crate::config::CellConfig;
    use alloc::string::String;

    fn cache_64_colors() -> CacheColoring {
        // way_size = 0x40000: 64 colors
        CacheColoring::new(4096, 16, 64)
    }

    fn cell(id: usize) -> Cell {
        Cell::new(id, CellConfig::new(String::from("test")))
    }

    #[test]
    fn flush_slices_through_the_window() {
        let hooks = MockHooks::new();
        let cache = cache_64_colors();
        let root = cell(0);
        let guest = cell(1);
        // all 64 colors: one fragment of 0x40000, four window slices
        let region = ColoredRegionCfg {
            phys_start: 0,
            virt_start: 0,
            size: 0x40000,
            flags: MemFlags::READ | MemFlags::WRITE,
            colors: u64::MAX,
            rebase_offset: 0,
        };
        apply_region(
            &hooks,
            &cache,
            &root,
            &guest,
            &region,
            RegionOp::Flush(FlushKind::Clean),
        )
        .unwrap();

        let state = hooks.snapshot();
        assert_eq!(state.flushes.len(), 4);
        for (va, size, kind) in &state.flushes {
            assert_eq!(*va, TEMP_BASE);
            assert_eq!(*size, NUM_TEMPORARY_PAGES * PAGE_SIZE);
            assert_eq!(*kind, FlushKind::Clean);
        }
        assert!(state.hv_maps.is_empty(), "window unmapped after the last slice");
    }

    #[test]
    fn smmu_absent_reports_not_supported() {
        let hooks = MockHooks::new();
        let cache = cache_64_colors();
        let root = cell(0);
        let guest = cell(1);
        let region = ColoredRegionCfg {
            phys_start: 0,
            virt_start: 0,
            size: 0x1000,
            flags: MemFlags::READ,
            colors: 1,
            rebase_offset: 0,
        };
        assert_eq!(
            apply_region(&hooks, &cache, &root, &guest, &region, RegionOp::SmmuCreate),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn claim_ledger_keeps_root_colors() {
        let record = Coloring::new(
            cache_64_colors(),
            Some(RootColorRegion {
                base: 0,
                size: 0x100000,
                colors: 0x0f,
            }),
        );
        assert_eq!(record.claimed_colors(), 0x0f);
        record.claim(0xf0);
        assert_eq!(record.claimed_colors(), 0xff);
        record.release(0xf0);
        assert_eq!(record.claimed_colors(), 0x0f);
        // releasing root bits by mistake must not orphan them
        record.release(0x0f);
        assert_eq!(record.claimed_colors(), 0x0f);
    }
}
