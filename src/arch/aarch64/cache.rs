use core::fmt::Display;

use aarch64_cpu::registers::{CCSIDR_EL1, CLIDR_EL1, CSSELR_EL1, ID_AA64MMFR2_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use crate::arch::{CacheIndexed, CacheInfoTrait, CacheType, FlushKind, PAGE_SIZE};

#[derive(Copy, Clone)]
pub struct Aarch64CacheInfo {
    level: usize,
    size: usize,

    num_sets: usize,

    cache_type: CacheType,

    indexed: CacheIndexed,

    associativity: usize, // a.k.a `ways`

    line_size: usize,

    // CCIDX feature, from ID_AA64MMFR2_EL1.read(ID_AA64MMFR2_EL1::CCIDX)
    has_ccidx: bool,
}

const MAX_CACHE_LEVEL: usize = 7;

impl Aarch64CacheInfo {
    #[allow(clippy::too_many_arguments)]
    fn new(
        level: usize,
        num_sets: usize,
        associativity: usize,
        line_size: usize,
        cache_type: CacheType,
        indexed: CacheIndexed,
        has_ccidx: bool,
    ) -> Self {
        let size = num_sets * associativity * line_size;
        Self {
            level,
            size,
            num_sets,
            associativity,
            line_size,
            cache_type,
            indexed,
            has_ccidx,
        }
    }

    #[inline]
    fn ctype(level: usize) -> usize {
        ((CLIDR_EL1.get() >> (3 * (level - 1))) & 0b111) as usize
    }

    #[inline]
    fn set_cache_level(level: u64) {
        CSSELR_EL1.write(CSSELR_EL1::Level.val(level - 1));
    }

    #[inline]
    fn read_ctr_el0() -> u64 {
        let ctr: u64;
        unsafe {
            core::arch::asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack));
        }
        ctr
    }

    pub fn indexed(&self) -> CacheIndexed {
        self.indexed
    }

    pub fn has_ccidx(&self) -> bool {
        self.has_ccidx
    }
}

impl CacheInfoTrait for Aarch64CacheInfo {
    fn get_cache_info(level: usize) -> Self {
        let has_ccidx = ID_AA64MMFR2_EL1.read(ID_AA64MMFR2_EL1::CCIDX) != 0;

        Self::set_cache_level(level as u64);
        // (Number of sets in cache) - 1, therefore a value of 0 indicates 1 set in the cache.
        // The number of sets does not have to be a power of 2.
        let num_sets = (CCSIDR_EL1.get_num_sets() + 1) as usize;

        // (Associativity of cache) - 1, therefore a value of 0 indicates an associativity of 1.
        // The associativity does not have to be a power of 2.
        let associativity = (CCSIDR_EL1.get_associativity() + 1) as usize;

        // (Log2(Number of bytes in cache line)) - 4. For example:
        // For a line length of 16 bytes: Log2(16) = 4, LineSize entry = 0. This is the minimum line length.
        // For a line length of 32 bytes: Log2(32) = 5, LineSize entry = 1.
        let line_size = 1 << (CCSIDR_EL1.read(CCSIDR_EL1::LineSize) + 4);

        let cache_type = match Self::ctype(level) {
            0b001 => CacheType::Instruction,
            0b010 => CacheType::Data,
            0b011 => CacheType::Separate,
            0b100 => CacheType::Unified,
            _ => CacheType::NoCache,
        };

        let indexed = if level == 1 {
            const CTR_L1LP_OFF: u64 = 14;
            const CTR_L1LP_PIPT: u64 = 0b11 << CTR_L1LP_OFF;
            const CTR_L1LP_MASK: u64 = 0b11 << CTR_L1LP_OFF;

            let ctr = Self::read_ctr_el0();
            if ctr & CTR_L1LP_MASK == CTR_L1LP_PIPT {
                CacheIndexed::Pipt
            } else {
                CacheIndexed::Vipt
            }
        } else {
            CacheIndexed::Pipt
        };

        Self::new(
            level,
            num_sets,
            associativity,
            line_size,
            cache_type,
            indexed,
            has_ccidx,
        )
    }

    #[inline]
    fn num_colors(&self) -> usize {
        self.size / (self.associativity * PAGE_SIZE)
    }

    #[inline]
    fn level(&self) -> usize {
        self.level
    }

    #[inline]
    fn num_sets(&self) -> usize {
        self.num_sets
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn ways(&self) -> usize {
        self.associativity
    }

    #[inline]
    fn line_size(&self) -> usize {
        self.line_size
    }

    #[inline]
    fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    fn init_cache_level() -> usize {
        let mut level = 1; // same with reg definition
        while level < MAX_CACHE_LEVEL {
            if Self::ctype(level) == 0b000 {
                break;
            }
            level += 1;
        }
        level - 1
    }
}

impl Display for Aarch64CacheInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let units = ["", "K", "M"];
        let mut size = self.size;
        let mut index = 0;
        while index < units.len() {
            if size >> 10 == 0 {
                break;
            }
            size >>= 10;
            index += 1;
        }
        let unit = units[index];
        write!(
            f,
            "L{} cache: {}{}B, line size {}B, {} associativity, {} num_sets, {} colors",
            self.level,
            size,
            unit,
            self.line_size,
            self.associativity,
            self.num_sets,
            self.num_colors()
        )
    }
}

/// Cache maintenance by VA over `[va, va + len)`, for backends implementing
/// the flush hook. The range is mapped in the hypervisor's own table.
pub fn dcache_flush_by_va(va: usize, len: usize, kind: FlushKind) {
    match kind {
        FlushKind::Clean => cache_flush_range(va, len, |addr| unsafe {
            core::arch::asm!("dc cvac, {0}", in(reg) addr, options(nostack));
        }),
        FlushKind::Invalidate => cache_flush_range(va, len, |addr| unsafe {
            core::arch::asm!("dc ivac, {0}", in(reg) addr, options(nostack));
        }),
        FlushKind::CleanAndInvalidate => cache_flush_range(va, len, |addr| unsafe {
            core::arch::asm!("dc civac, {0}", in(reg) addr, options(nostack));
        }),
    }
}

#[inline]
fn cache_flush_range<F>(va: usize, len: usize, f: F)
where
    F: Fn(usize),
{
    let min_line_size = 64;

    // align the start with a cache line
    let mut addr = va & !(min_line_size - 1);
    while addr < va + len {
        f(addr); // maintenance to PoC by VA
        addr += min_line_size;
    }
    unsafe {
        core::arch::asm!("dmb sy");
    }
}
