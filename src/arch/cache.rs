use alloc::vec::Vec;
use core::fmt::Display;

/// Per-level view of the cache-hierarchy-identification registers.
pub trait CacheInfoTrait {
    /// Get how many levels of cache there are in the system
    fn init_cache_level() -> usize;

    fn get_cache_info(level: usize) -> Self;

    fn level(&self) -> usize;

    fn num_sets(&self) -> usize;

    fn size(&self) -> usize;

    /// ways of associativity
    fn ways(&self) -> usize;

    fn line_size(&self) -> usize;

    fn cache_type(&self) -> CacheType;

    fn num_colors(&self) -> usize;
}

#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    NoCache,
    Instruction,
    Data,
    Separate,
    Unified,
}

#[derive(Copy, Clone, Default)]
pub enum CacheIndexed {
    #[default]
    Pipt,
    Vipt,
}

/// D-cache maintenance-by-VA operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushKind {
    Clean,
    Invalidate,
    CleanAndInvalidate,
}

pub struct CpuCacheInfo<T: CacheInfoTrait> {
    pub info_list: Vec<T>,
    pub last_unified_level: Option<usize>,
    pub num_levels: usize,
}

impl<T: CacheInfoTrait + Display> CpuCacheInfo<T> {
    /// Walk the identification registers from L1 upward. Coloring targets the
    /// last unified level; `None` means the platform has no unified cache and
    /// coloring stays disabled.
    pub fn probe() -> Self {
        let num_levels = T::init_cache_level();

        let mut info_list = Vec::new();
        let mut last_unified_level = None;

        for i in 1..=num_levels {
            let cache_info = T::get_cache_info(i);
            if cache_info.cache_type() == CacheType::Unified {
                last_unified_level = Some(i);
            }
            info!("{}", cache_info);
            info_list.push(cache_info);
        }

        CpuCacheInfo {
            info_list,
            last_unified_level,
            num_levels,
        }
    }

    pub fn coloring_target(&self) -> Option<&T> {
        self.last_unified_level.map(|level| &self.info_list[level - 1])
    }
}
