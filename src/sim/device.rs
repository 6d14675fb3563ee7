//! State shared by every thread of the simulated block

use super::mbarrier::MBarrierGroup;
use super::memory::MemRef;
use super::mma::WarpExchange;
use super::tma::{TensorMapDescriptor, TmaUnit};
use super::{SimError, SimResult, Stats, StatsSnapshot, lock};
use crate::config::SimConfig;
use crate::ir::{AllocInit, MemRefType, MemorySpace};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Bytes one mbarrier occupies in shared memory
const MBARRIER_BYTES: usize = 8;

/// Object created once per program site and shared by all threads
#[derive(Debug, Clone)]
pub enum SiteObject {
    MemRef(MemRef),
    Barriers(MBarrierGroup),
    TensorMap(TensorMapDescriptor),
}

/// Arrivals at the block-wide barrier in the current generation
#[derive(Debug, Default)]
struct BlockBarrier {
    arrived: usize,
    generation: u64,
}

/// One thread block
#[derive(Debug)]
pub struct Device {
    config: SimConfig,
    stats: Arc<Stats>,
    tma: TmaUnit,
    sites: Mutex<FxHashMap<usize, SiteObject>>,
    shared_used: Mutex<usize>,
    warps: Vec<WarpExchange>,
    block: Mutex<BlockBarrier>,
    block_ready: Condvar,
    aborted: AtomicBool,
}

impl Device {
    pub fn new(config: SimConfig) -> Self {
        let stats = Arc::new(Stats::default());
        let warps = (0..config.warps())
            .map(|warp| {
                let lanes = (config.threads - warp * config.warp_size).min(config.warp_size);
                WarpExchange::new(warp, lanes, config.warp_size)
            })
            .collect();
        Self {
            tma: TmaUnit::new(config.cluster_size, config.cta_rank, Arc::clone(&stats)),
            config,
            stats,
            sites: Mutex::new(FxHashMap::default()),
            shared_used: Mutex::new(0),
            warps,
            block: Mutex::new(BlockBarrier::default()),
            block_ready: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn tma(&self) -> &TmaUnit {
        &self.tma
    }

    /// Warp that `thread` belongs to, and its lane
    pub fn warp_of(&self, thread: usize) -> SimResult<(&WarpExchange, usize)> {
        let warp = self
            .warps
            .get(thread / self.config.warp_size)
            .ok_or_else(|| {
                SimError::InvalidValue(format!(
                    "thread {} is outside a block of {}",
                    thread, self.config.threads
                ))
            })?;
        Ok((warp, thread % self.config.warp_size))
    }

    fn reserve_shared(&self, bytes: usize) -> SimResult<()> {
        let mut used = lock(&self.shared_used);
        let available = self.config.shared_memory_bytes.saturating_sub(*used);
        if bytes > available {
            return Err(SimError::SharedMemoryExhausted {
                requested: bytes,
                available,
            });
        }
        *used += bytes;
        Ok(())
    }

    pub fn shared_used(&self) -> usize {
        *lock(&self.shared_used)
    }

    /// Allocate a buffer; shared allocations count against the block budget
    pub fn alloc(&self, ty: &MemRefType, init: AllocInit) -> SimResult<MemRef> {
        let memref = MemRef::alloc(ty, init)?;
        if memref.space() == MemorySpace::Shared {
            self.reserve_shared(memref.size_bytes())?;
        }
        debug!(ty = %ty, bytes = memref.size_bytes(), "alloc");
        Ok(memref)
    }

    pub fn create_mbarrier_group(&self, space: MemorySpace, count: usize) -> SimResult<MBarrierGroup> {
        let group = MBarrierGroup::new(space, count)?.with_stats(Arc::clone(&self.stats));
        self.reserve_shared(count * MBARRIER_BYTES)?;
        debug!(count, "create mbarrier group");
        Ok(group)
    }

    /// Object of program site `site`, created by the first thread to get there
    pub fn site_object(
        &self,
        site: usize,
        create: impl FnOnce() -> SimResult<SiteObject>,
    ) -> SimResult<SiteObject> {
        let mut sites = lock(&self.sites);
        if let Some(object) = sites.get(&site) {
            return Ok(object.clone());
        }
        let object = create()?;
        sites.insert(site, object.clone());
        Ok(object)
    }

    /// Object already created for `site`
    pub fn site(&self, site: usize) -> Option<SiteObject> {
        lock(&self.sites).get(&site).cloned()
    }

    /// Point a tensor map at a new source region without fencing it
    pub fn replace_descriptor_source(
        &self,
        descriptor: TensorMapDescriptor,
        source: &MemRef,
    ) -> SimResult<()> {
        self.tma.replace_source(descriptor, source)
    }

    /// Wait until every thread of the block has arrived
    pub fn sync_threads(&self) -> SimResult<()> {
        let mut block = lock(&self.block);
        block.arrived += 1;
        let generation = block.generation;
        if block.arrived == self.config.threads {
            block.arrived = 0;
            block.generation += 1;
            trace!(generation = block.generation, "block barrier");
            self.block_ready.notify_all();
            return Ok(());
        }
        while block.generation == generation {
            self.check_aborted()?;
            block = self
                .block_ready
                .wait_timeout(block, Duration::from_millis(1))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        Ok(())
    }

    /// Let hardware units make progress: in-flight TMA loads land
    pub fn progress(&self) -> SimResult<usize> {
        self.tma.progress()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn abort_flag(&self) -> &AtomicBool {
        &self.aborted
    }

    pub fn check_aborted(&self) -> SimResult<()> {
        if self.aborted.load(Ordering::Relaxed) {
            Err(SimError::Aborted)
        } else {
            Ok(())
        }
    }
}
