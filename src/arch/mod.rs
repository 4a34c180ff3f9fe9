pub use self::cache::*;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub use self::aarch64::*;
        mod aarch64;
    }
}

mod cache;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Virtual base added to loader and hypervisor-scratch mappings so they never
/// collide with ordinary cell memory.
pub const ROOT_MAP_OFFSET: usize = 0x80_0000_0000;

/// Pages in one per-CPU temporary mapping window; bounds the slice size used
/// by D-cache flushes and the recoloring copy.
pub const NUM_TEMPORARY_PAGES: usize = 16;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(ROOT_MAP_OFFSET & PAGE_MASK == 0);
const_assert!(NUM_TEMPORARY_PAGES > 0);
