//! Last-level-cache coloring for a partitioning hypervisor.
//!
//! Cells (isolated partitions) are kept from evicting each other's LLC lines
//! by constraining which physical page frames back their memory: two cells
//! whose color bitmaps are disjoint never share a cache set. This crate owns
//! the color arithmetic, the expansion of a colored region into physical
//! fragments, the per-fragment mapping operations, the cell lifecycle
//! dispatch, and the in-place recoloring of the already-running root cell.
//!
//! Page tables, the SMMU, cache maintenance and the stop-the-world barrier
//! stay with the embedding hypervisor, reached through [`ColoringHooks`].
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod arch;
mod config;
mod kernel;
mod mm;
mod util;

pub use arch::{CacheIndexed, CacheInfoTrait, CacheType, CpuCacheInfo, FlushKind};
pub use arch::{NUM_TEMPORARY_PAGES, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, ROOT_MAP_OFFSET};
#[cfg(target_arch = "aarch64")]
pub use arch::{dcache_flush_by_va, Aarch64CacheInfo};
pub use config::{color_bitmap, CellConfig, ColoredRegionCfg, MemFlags, MemRegionCfg};
pub use kernel::{
    apply_region, colored_cell_create, colored_cell_destroy, colored_cell_flush,
    colored_cell_load, colored_cell_start, coloring, coloring_disable, coloring_enable,
    validate_cell_config, Cell, Coloring, ColoringHooks, Error, RegionOp, RegionState, RemapMode,
    RootColorRegion,
};
pub use mm::{fragments, CacheColoring, ColorRanges, Fragment};
