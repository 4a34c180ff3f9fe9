pub use cell::Cell;
pub use coloring::{
    apply_region, coloring, Coloring, ColoringHooks, RegionOp, RemapMode, RootColorRegion,
};
pub use lifecycle::{
    colored_cell_create, colored_cell_destroy, colored_cell_flush, colored_cell_load,
    colored_cell_start, coloring_disable, coloring_enable, RegionState,
};
pub use validate::validate_cell_config;

mod cell;
mod coloring;
mod lifecycle;
mod recolor;
mod validate;

use derive_more::Display;

/// Failure modes of the coloring subsystem.
///
/// Create/load/start errors abort the enclosing cell-state change and the
/// partial work is reverted; destroy-path errors are logged and never stop
/// shutdown from making progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Error {
    /// Colors zero or out of range, managed region without a root pool, or a
    /// colored region declared on a platform without a unified cache.
    #[display(fmt = "invalid cell configuration")]
    ConfigInvalid,
    /// Managed walk past the root pool end, or a manual region overlapping
    /// the root pool.
    #[display(fmt = "colored region out of bounds")]
    OutOfBounds,
    /// Page pool exhausted while installing page-table nodes.
    #[display(fmt = "out of pool pages")]
    OutOfMemory,
    /// SMMU operation requested but no SMMU hook was installed at boot.
    #[display(fmt = "operation not supported")]
    NotSupported,
    /// A conflicting root-cell mapping was found while returning frames.
    #[display(fmt = "conflicting root cell mapping")]
    RootConflict,
}

#[cfg(test)]
pub(crate) mod testing {
    use alloc::collections::{BTreeMap, BTreeSet};
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::arch::{FlushKind, PAGE_SIZE};
    use crate::config::MemFlags;
    use crate::mm::Fragment;

    use super::{Cell, ColoringHooks, Error, RemapMode};

    pub const TEMP_BASE: usize = 0xffff_0000;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mapping {
        pub phys: usize,
        pub size: usize,
        pub flags: MemFlags,
    }

    /// Page tables, root frame ownership and physical memory, as one
    /// observable value the tests can snapshot and diff.
    #[derive(Clone, Default, PartialEq, Eq)]
    pub struct MockState {
        pub cell_maps: BTreeMap<usize, BTreeMap<usize, Mapping>>,
        pub smmu_maps: BTreeMap<usize, BTreeMap<usize, Mapping>>,
        pub root_frames: BTreeSet<usize>,
        pub hv_maps: BTreeMap<usize, (usize, usize)>,
        pub flushes: Vec<(usize, usize, FlushKind)>,
        pub map_calls: usize,
        pub mem: Vec<u8>,
    }

    pub struct MockHooks {
        pub state: Mutex<MockState>,
        pub smmu: bool,
        pub fail_map_after: Option<usize>,
        pub park_depth: Mutex<i32>,
    }

    impl MockHooks {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                smmu: false,
                fail_map_after: None,
                park_depth: Mutex::new(0),
            }
        }

        pub fn with_mem(len: usize) -> Self {
            let hooks = Self::new();
            hooks.state.lock().mem = vec![0; len];
            hooks
        }

        pub fn seed_root_frames(&self, start: usize, size: usize) {
            let mut state = self.state.lock();
            for frame in (start..start + size).step_by(PAGE_SIZE) {
                state.root_frames.insert(frame);
            }
        }

        pub fn seed_cell_map(&self, cell_id: usize, virt: usize, mapping: Mapping) {
            self.state
                .lock()
                .cell_maps
                .entry(cell_id)
                .or_default()
                .insert(virt, mapping);
        }

        pub fn snapshot(&self) -> MockState {
            self.state.lock().clone()
        }

        fn translate(state: &MockState, va: usize) -> usize {
            for (virt, (phys, size)) in state.hv_maps.iter() {
                if va >= *virt && va < virt + size {
                    return phys + (va - virt);
                }
            }
            panic!("no hypervisor mapping covers {va:#x}");
        }
    }

    impl ColoringHooks for MockHooks {
        fn map(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.map_calls += 1;
            if let Some(limit) = self.fail_map_after {
                if state.map_calls > limit {
                    return Err(Error::OutOfMemory);
                }
            }
            state.cell_maps.entry(cell.id()).or_default().insert(
                frag.virt,
                Mapping {
                    phys: frag.phys,
                    size: frag.size,
                    flags: frag.flags,
                },
            );
            Ok(())
        }

        fn unmap(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
            self.state
                .lock()
                .cell_maps
                .get_mut(&cell.id())
                .and_then(|maps| maps.remove(&frag.virt))
                .map(|_| ())
                .ok_or(Error::RootConflict)
        }

        fn subpage(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
            self.map(cell, frag)
        }

        fn unmap_from_root(&self, frag: &Fragment) -> Result<(), Error> {
            let mut state = self.state.lock();
            for frame in (frag.phys..frag.phys + frag.size).step_by(PAGE_SIZE) {
                if !state.root_frames.remove(&frame) {
                    return Err(Error::RootConflict);
                }
            }
            Ok(())
        }

        fn remap_to_root(&self, frag: &Fragment, _mode: RemapMode) -> Result<(), Error> {
            let mut state = self.state.lock();
            for frame in (frag.phys..frag.phys + frag.size).step_by(PAGE_SIZE) {
                if !state.root_frames.insert(frame) {
                    return Err(Error::RootConflict);
                }
            }
            Ok(())
        }

        fn smmu_map(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
            if !self.smmu {
                return Err(Error::NotSupported);
            }
            self.state.lock().smmu_maps.entry(cell.id()).or_default().insert(
                frag.virt,
                Mapping {
                    phys: frag.phys,
                    size: frag.size,
                    flags: frag.flags,
                },
            );
            Ok(())
        }

        fn smmu_unmap(&self, cell: &Cell, frag: &Fragment) -> Result<(), Error> {
            if !self.smmu {
                return Err(Error::NotSupported);
            }
            self.state
                .lock()
                .smmu_maps
                .get_mut(&cell.id())
                .and_then(|maps| maps.remove(&frag.virt))
                .map(|_| ())
                .ok_or(Error::RootConflict)
        }

        fn hv_map(&self, phys: usize, virt: usize, size: usize, _flags: MemFlags) -> Result<(), Error> {
            self.state.lock().hv_maps.insert(virt, (phys, size));
            Ok(())
        }

        fn hv_unmap(&self, virt: usize, _size: usize) -> Result<(), Error> {
            self.state
                .lock()
                .hv_maps
                .remove(&virt)
                .map(|_| ())
                .ok_or(Error::RootConflict)
        }

        fn dcache_flush_by_va(&self, va: usize, size: usize, kind: FlushKind) {
            self.state.lock().flushes.push((va, size, kind));
        }

        fn temp_map_base(&self) -> usize {
            TEMP_BASE
        }

        fn park_other_cpus(&self) {
            *self.park_depth.lock() += 1;
        }

        fn release_cpus(&self) {
            *self.park_depth.lock() -= 1;
        }

        fn copy_mem(&self, dst: usize, src: usize, len: usize) {
            let mut state = self.state.lock();
            let dst_pa = Self::translate(&state, dst);
            let src_pa = Self::translate(&state, src);
            let bytes: Vec<u8> = state.mem[src_pa..src_pa + len].to_vec();
            state.mem[dst_pa..dst_pa + len].copy_from_slice(&bytes);
        }
    }
}
