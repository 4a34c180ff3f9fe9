use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::CellConfig;

use super::lifecycle::RegionState;

pub const ROOT_CELL_ID: usize = 0;

/// An isolated partition as seen by the coloring subsystem: an identifier
/// plus the descriptor that owns its region lists. The stage-2 and SMMU
/// tables themselves live behind the hooks, keyed by the cell.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<Mutex<CellInner>>,
}

struct CellInner {
    id: usize,
    config: CellConfig,
    region_states: Vec<RegionState>,
}

impl Cell {
    pub fn new(id: usize, config: CellConfig) -> Cell {
        let region_states = vec![RegionState::Declared; config.colored_regions.len()];
        Cell {
            inner: Arc::new(Mutex::new(CellInner {
                id,
                config,
                region_states,
            })),
        }
    }

    pub fn id(&self) -> usize {
        let inner = self.inner.lock();
        inner.id
    }

    pub fn is_root(&self) -> bool {
        self.id() == ROOT_CELL_ID
    }

    pub fn config(&self) -> CellConfig {
        let inner = self.inner.lock();
        inner.config.clone()
    }

    /// Replace the descriptor, e.g. after validation filled in managed bases.
    /// Every colored region drops back to `Declared`.
    pub fn set_config(&self, config: CellConfig) {
        let mut inner = self.inner.lock();
        inner.region_states = vec![RegionState::Declared; config.colored_regions.len()];
        inner.config = config;
    }

    pub fn region_state(&self, idx: usize) -> RegionState {
        let inner = self.inner.lock();
        inner.region_states[idx]
    }

    pub(crate) fn set_region_state(&self, idx: usize, state: RegionState) {
        let mut inner = self.inner.lock();
        trace!(
            "cell {}: colored region {} {:?} -> {:?}",
            inner.id,
            idx,
            inner.region_states[idx],
            state
        );
        inner.region_states[idx] = state;
    }
}
