use std::time::Duration;

use crate::launch::{Dim3, LaunchConfig};

/// What one execution group did during a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub block_idx: Dim3,
    pub barrier_inits: u32,
    pub tx_expectations: u32,
    pub prefetches: u32,
    pub loads_issued: u32,
    pub stores_issued: u32,
    pub bytes_loaded: u64,
    pub bytes_stored: u64,
    /// Innermost-first box coordinates of every issued load.
    pub load_coords: Vec<[i32; 2]>,
    pub store_coords: Vec<[i32; 2]>,
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub kernel: String,
    pub config: LaunchConfig,
    pub elapsed: Duration,
    /// Whether the grid ended in a fault or a watchdog abort.
    pub faulted: bool,
    pub groups: Vec<GroupReport>,
}

impl LaunchReport {
    pub fn group(&self, block_idx: Dim3) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.block_idx == block_idx)
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.groups.iter().map(|g| g.bytes_loaded).sum()
    }

    pub fn bytes_stored(&self) -> u64 {
        self.groups.iter().map(|g| g.bytes_stored).sum()
    }
}
