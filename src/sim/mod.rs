//! Semantic model of the asynchronous copy, mbarrier, TMA and MMA units
//!
//! Everything here is usable directly as a library; the interpreter is just
//! one client. State shared by the threads of a block lives in `Device`;
//! per-thread hardware queues (`AsyncCopyUnit`, `WarpgroupMmaUnit`) are owned
//! by the thread that issues into them.

pub mod async_copy;
pub mod device;
pub mod group;
pub mod mbarrier;
pub mod memory;
pub mod mma;
pub mod tma;
pub mod warpgroup;

pub use async_copy::{AsyncCopyUnit, CopyId};
pub use device::{Device, SiteObject};
pub use group::{GroupQueue, GroupToken};
pub use mbarrier::{MBarrierGroup, MBarrierToken};
pub use memory::MemRef;
pub use mma::{LaneFragments, MmaLayout, WarpExchange, rcp};
pub use tma::{TensorMapDescriptor, TmaUnit};
pub use warpgroup::{MmaAccumulator, WarpgroupMatrixDescriptor, WarpgroupMmaUnit};

use crate::diagnostics::VerifyError;
use miette::Diagnostic;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised while executing the model
#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum SimError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Verify(#[from] VerifyError),

    #[error("mbarrier {0} is used before init")]
    #[diagnostic(code(sim::uninitialized_barrier))]
    UninitializedBarrier(usize),

    #[error("mbarrier {index} is outside a group of {count}")]
    #[diagnostic(code(sim::barrier_out_of_range))]
    BarrierOutOfRange { index: usize, count: usize },

    #[error("index {index:?} is out of bounds for shape {shape:?}")]
    #[diagnostic(code(sim::out_of_bounds))]
    OutOfBounds { index: Vec<i64>, shape: Vec<usize> },

    #[error("unknown tensor-map descriptor #{0}")]
    #[diagnostic(code(sim::unknown_descriptor))]
    UnknownDescriptor(u64),

    #[error("shared memory exhausted: {requested} bytes requested, {available} available")]
    #[diagnostic(code(sim::shared_memory_exhausted))]
    SharedMemoryExhausted { requested: usize, available: usize },

    #[error("{what} did not complete within {rounds} rounds")]
    #[diagnostic(
        code(sim::watchdog),
        help("the awaited phase or transfer is never completed by any thread")
    )]
    WatchdogExpired { what: String, rounds: u64 },

    #[error("warp {warp} has {lanes} of {warp_size} lanes; warp-collective operations need a full warp")]
    #[diagnostic(code(sim::partial_warp))]
    PartialWarp {
        warp: usize,
        lanes: usize,
        warp_size: usize,
    },

    #[error("{0} is verified but not executed by the simulator")]
    #[diagnostic(code(sim::unsupported))]
    Unsupported(String),

    #[error("invalid runtime value: {0}")]
    #[diagnostic(code(sim::invalid_value))]
    InvalidValue(String),

    #[error("execution aborted by another thread")]
    #[diagnostic(code(sim::aborted))]
    Aborted,
}

pub type SimResult<T> = Result<T, SimError>;

/// Lock a mutex, taking over the data of a poisoned one
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Device-wide event counters
#[derive(Debug, Default)]
pub struct Stats {
    pub copies_retired: AtomicU64,
    pub groups_retired: AtomicU64,
    pub phase_flips: AtomicU64,
    pub tma_loads: AtomicU64,
    pub tma_stores: AtomicU64,
    pub multicast_remote_writes: AtomicU64,
    pub wgmma_groups: AtomicU64,
    pub hazards: AtomicU64,
}

/// Point-in-time copy of `Stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub copies_retired: u64,
    pub groups_retired: u64,
    pub phase_flips: u64,
    pub tma_loads: u64,
    pub tma_stores: u64,
    pub multicast_remote_writes: u64,
    pub wgmma_groups: u64,
    pub hazards: u64,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            copies_retired: get(&self.copies_retired),
            groups_retired: get(&self.groups_retired),
            phase_flips: get(&self.phase_flips),
            tma_loads: get(&self.tma_loads),
            tma_stores: get(&self.tma_stores),
            multicast_remote_writes: get(&self.multicast_remote_writes),
            wgmma_groups: get(&self.wgmma_groups),
            hazards: get(&self.hazards),
        }
    }
}
