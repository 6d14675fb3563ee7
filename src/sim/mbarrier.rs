//! Multi-phase arrival barriers
//!
//! Every barrier tracks the arrivals still missing in its current phase and a
//! signed transaction count. A phase completes when both reach zero on a
//! completing event (a regular arrival or a transaction completion); the
//! phase counter then advances and pending arrivals reset to the expected
//! count. Each barrier is one mutex, so every update is one atomic step and
//! arrivals from different threads commute.

use super::{SimError, SimResult, Stats, lock};
use crate::diagnostics::VerifyError;
use crate::ir::MemorySpace;
use crate::verify::rules;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Phase a thread arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MBarrierToken {
    pub barrier: usize,
    pub phase: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MBarrierState {
    expected: u32,
    pending: i64,
    tx_count: i64,
    phase: u64,
}

impl MBarrierState {
    fn at_phase_boundary(&self) -> bool {
        self.pending == self.expected as i64 && self.tx_count == 0
    }
}

/// Fixed-size group of barriers, shared by every thread that holds a clone
#[derive(Debug, Clone)]
pub struct MBarrierGroup {
    slots: Arc<[Mutex<Option<MBarrierState>>]>,
    stats: Option<Arc<Stats>>,
}

impl MBarrierGroup {
    /// Create `count` uninitialized barriers in `space`
    pub fn new(space: MemorySpace, count: usize) -> SimResult<Self> {
        rules::check_mbarrier_group(space, count)?;
        Ok(Self {
            slots: (0..count).map(|_| Mutex::new(None)).collect(),
            stats: None,
        })
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: usize) -> SimResult<&Mutex<Option<MBarrierState>>> {
        self.slots.get(id).ok_or(SimError::BarrierOutOfRange {
            index: id,
            count: self.slots.len(),
        })
    }

    /// Run `f` on an initialized barrier under its lock
    fn update<T>(&self, id: usize, f: impl FnOnce(&mut MBarrierState) -> T) -> SimResult<T> {
        let mut slot = lock(self.slot(id)?);
        let state = slot.as_mut().ok_or(SimError::UninitializedBarrier(id))?;
        Ok(f(state))
    }

    /// Advance the phase if nothing is missing any more
    fn try_complete(&self, id: usize, state: &mut MBarrierState) -> bool {
        if state.pending > 0 || state.tx_count != 0 {
            return false;
        }
        state.phase += 1;
        state.pending = state.expected as i64;
        if let Some(stats) = &self.stats {
            Stats::bump(&stats.phase_flips, 1);
        }
        debug!(barrier = id, phase = state.phase, "mbarrier phase complete");
        true
    }

    pub fn is_initialized(&self, id: usize) -> SimResult<bool> {
        Ok(lock(self.slot(id)?).is_some())
    }

    /// Set the expected arrival count; a false predicate does nothing
    ///
    /// Re-initializing at a phase boundary resets the threshold and keeps the
    /// phase. Re-initializing while the current phase has partial arrivals or
    /// pending transactions is rejected.
    pub fn init(&self, id: usize, expected: u32, predicate: bool) -> SimResult<()> {
        if !predicate {
            return Ok(());
        }
        if expected == 0 {
            return Err(SimError::InvalidValue(
                "mbarrier arrival count must be positive".to_string(),
            ));
        }
        let mut slot = lock(self.slot(id)?);
        match slot.as_mut() {
            None => {
                *slot = Some(MBarrierState {
                    expected,
                    pending: expected as i64,
                    tx_count: 0,
                    phase: 0,
                });
                debug!(barrier = id, expected, "mbarrier init");
            }
            Some(state) if state.at_phase_boundary() => {
                state.expected = expected;
                state.pending = expected as i64;
                debug!(barrier = id, expected, phase = state.phase, "mbarrier re-init");
            }
            Some(_) => return Err(VerifyError::AlreadyInitialized(id).into()),
        }
        Ok(())
    }

    /// One full arrival; may complete the phase
    pub fn arrive(&self, id: usize) -> SimResult<MBarrierToken> {
        let mut slot = lock(self.slot(id)?);
        let state = slot.as_mut().ok_or(SimError::UninitializedBarrier(id))?;
        let token = MBarrierToken {
            barrier: id,
            phase: state.phase,
        };
        state.pending -= 1;
        trace!(barrier = id, pending = state.pending, "mbarrier arrive");
        self.try_complete(id, state);
        Ok(token)
    }

    /// Count `count` arrivals without ever completing the phase
    pub fn arrive_no_complete(&self, id: usize, count: u32) -> SimResult<MBarrierToken> {
        self.update(id, |state| {
            state.pending -= count as i64;
            trace!(barrier = id, count, pending = state.pending, "mbarrier arrive.nocomplete");
            MBarrierToken {
                barrier: id,
                phase: state.phase,
            }
        })
    }

    /// Expect `tx_count` more transaction bytes in the current phase
    pub fn expect_tx(&self, id: usize, tx_count: u32) -> SimResult<()> {
        self.update(id, |state| {
            state.tx_count += tx_count as i64;
            trace!(barrier = id, tx = state.tx_count, "mbarrier expect_tx");
        })
    }

    /// Expect transactions and arrive in one update; a false predicate does
    /// nothing
    pub fn arrive_expect_tx(
        &self,
        id: usize,
        tx_count: u32,
        predicate: bool,
    ) -> SimResult<Option<MBarrierToken>> {
        if !predicate {
            return Ok(None);
        }
        let mut slot = lock(self.slot(id)?);
        let state = slot.as_mut().ok_or(SimError::UninitializedBarrier(id))?;
        let token = MBarrierToken {
            barrier: id,
            phase: state.phase,
        };
        state.tx_count += tx_count as i64;
        state.pending -= 1;
        trace!(
            barrier = id,
            tx = state.tx_count,
            pending = state.pending,
            "mbarrier arrive.expect_tx"
        );
        self.try_complete(id, state);
        Ok(Some(token))
    }

    /// Complete `bytes` transaction bytes; may complete the phase
    pub fn complete_tx(&self, id: usize, bytes: u64) -> SimResult<()> {
        let mut slot = lock(self.slot(id)?);
        let state = slot.as_mut().ok_or(SimError::UninitializedBarrier(id))?;
        state.tx_count -= bytes as i64;
        trace!(barrier = id, tx = state.tx_count, "mbarrier complete_tx");
        self.try_complete(id, state);
        Ok(())
    }

    /// Whether the phase `token` arrived on has completed
    pub fn test_wait(&self, id: usize, token: MBarrierToken) -> SimResult<bool> {
        if token.barrier != id {
            return Err(VerifyError::InvalidOperand(format!(
                "token of mbarrier {} tested against mbarrier {}",
                token.barrier, id
            ))
            .into());
        }
        self.update(id, |state| state.phase > token.phase)
    }

    /// Whether the most recent phase with parity `parity` has completed
    pub fn phase_complete(&self, id: usize, parity: bool) -> SimResult<bool> {
        self.update(id, |state| (state.phase & 1) != parity as u64)
    }

    /// Poll for up to `polls` rounds; false when the budget runs out first
    pub fn try_wait_parity(&self, id: usize, parity: bool, polls: u64) -> SimResult<bool> {
        for _ in 0..polls.max(1) {
            if self.phase_complete(id, parity)? {
                return Ok(true);
            }
            std::thread::yield_now();
        }
        Ok(false)
    }

    /// Retry `try_wait_parity` until it succeeds
    ///
    /// `progress` runs before every round of `polls` polls; it drives
    /// outstanding transfers and reports an abort. After `rounds` failed
    /// rounds the wait is reported as stuck.
    pub fn wait_parity(
        &self,
        id: usize,
        parity: bool,
        polls: u64,
        rounds: u64,
        mut progress: impl FnMut() -> SimResult<()>,
    ) -> SimResult<()> {
        for _ in 0..rounds {
            progress()?;
            if self.try_wait_parity(id, parity, polls)? {
                return Ok(());
            }
        }
        Err(SimError::WatchdogExpired {
            what: format!("wait on mbarrier {} parity {}", id, parity as u8),
            rounds,
        })
    }

    /// Return the barrier to the uninitialized state
    pub fn inval(&self, id: usize) -> SimResult<()> {
        *lock(self.slot(id)?) = None;
        debug!(barrier = id, "mbarrier inval");
        Ok(())
    }

    pub fn phase(&self, id: usize) -> SimResult<u64> {
        self.update(id, |state| state.phase)
    }

    /// Arrivals still missing in the current phase
    pub fn pending(&self, id: usize) -> SimResult<i64> {
        self.update(id, |state| state.pending)
    }

    pub fn tx_count(&self, id: usize) -> SimResult<i64> {
        self.update(id, |state| state.tx_count)
    }
}

impl PartialEq for MBarrierGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}
