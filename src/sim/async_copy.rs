//! Asynchronous global-to-shared copies
//!
//! Each thread owns one `AsyncCopyUnit`. Issued copies sit in the open group
//! until `create_group` seals them; sealed groups retire oldest-first when the
//! thread waits (or when `progress` is called), and only then does the
//! destination observe the data. Source elements are captured at issue.

use super::group::{GroupQueue, GroupToken};
use super::memory::MemRef;
use super::{SimError, SimResult, Stats};
use crate::diagnostics::VerifyError;
use crate::verify::rules;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle of one issued copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CopyId(u64);

impl fmt::Display for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "copy#{}", self.0)
    }
}

#[derive(Debug)]
struct PendingCopy {
    id: CopyId,
    dst: MemRef,
    dst_offset: usize,
    /// `dst_elements` values; the part past `src_elements` is zero
    data: Vec<f64>,
}

/// Per-thread async copy queue
#[derive(Debug, Default)]
pub struct AsyncCopyUnit {
    next_id: u64,
    queue: GroupQueue<PendingCopy>,
    stats: Option<Arc<Stats>>,
}

impl AsyncCopyUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<Stats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }

    /// Issue one copy of `dst_elements` elements
    ///
    /// With `src_elements` below `dst_elements`, only that many elements are
    /// read and the rest of the destination span is zero-filled.
    #[allow(clippy::too_many_arguments)]
    pub fn issue_copy(
        &mut self,
        src: &MemRef,
        src_indices: &[i64],
        dst: &MemRef,
        dst_indices: &[i64],
        dst_elements: u64,
        src_elements: Option<u64>,
        bypass_l1: bool,
    ) -> SimResult<CopyId> {
        rules::check_async_copy(
            src.ty(),
            src_indices.len(),
            dst.ty(),
            dst_indices.len(),
            dst_elements,
            src_elements,
            bypass_l1,
        )?;

        let dst_count = dst_elements as usize;
        let src_count = src_elements.unwrap_or(dst_elements) as usize;
        let src_offset = src.offset(src_indices)?;
        let dst_offset = dst.offset(dst_indices)?;
        if dst_offset + dst_count > dst.len() {
            return Err(SimError::OutOfBounds {
                index: dst_indices.to_vec(),
                shape: dst.shape().to_vec(),
            });
        }

        let mut data = src.read_linear(src_offset, src_count)?;
        data.resize(dst_count, 0.0);

        let id = CopyId(self.next_id);
        self.next_id += 1;
        debug!(%id, dst_elements, src_count, bypass_l1, "issue async copy");
        self.queue.push(PendingCopy {
            id,
            dst: dst.clone(),
            dst_offset,
            data,
        });
        Ok(id)
    }

    /// Seal the open group
    ///
    /// Every id in `copies` must be issued by this unit and not yet grouped.
    /// Copies issued but not listed are swept into the same group.
    pub fn create_group(&mut self, copies: &[CopyId]) -> SimResult<GroupToken> {
        let mut seen = FxHashSet::default();
        for id in copies {
            if id.0 >= self.next_id {
                return Err(VerifyError::InvalidOperand(format!(
                    "{} was not issued by this thread",
                    id
                ))
                .into());
            }
            let open = self.queue.open().iter().any(|c| c.id == *id);
            if !open || !seen.insert(*id) {
                return Err(VerifyError::DoubleGroupMembership(id.to_string()).into());
            }
        }

        let swept = self.queue.open().len() - copies.len();
        let token = self.queue.seal();
        debug!(%token, listed = copies.len(), swept, "seal copy group");
        Ok(token)
    }

    /// Block until at most `max_outstanding` groups (default 0) created at or
    /// before `token` are still outstanding
    pub fn wait(&mut self, token: GroupToken, max_outstanding: Option<u32>) -> SimResult<usize> {
        if !self.queue.is_issued(token) {
            return Err(VerifyError::InvalidOperand(format!(
                "{} was not created by this thread",
                token
            ))
            .into());
        }
        let limit = max_outstanding.unwrap_or(0) as usize;
        let stats = self.stats.as_deref();
        let retired = self
            .queue
            .wait(token, limit, |t, copies| retire_group(stats, t, copies))?;
        debug!(%token, limit, retired, "async wait");
        Ok(retired)
    }

    /// Retire the oldest outstanding group, if any
    pub fn progress(&mut self) -> SimResult<bool> {
        match self.queue.retire_oldest() {
            Some((token, copies)) => {
                retire_group(self.stats.as_deref(), token, copies)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn outstanding_groups(&self) -> usize {
        self.queue.outstanding()
    }

    /// Copies issued but not yet sealed into a group
    pub fn ungrouped(&self) -> usize {
        self.queue.open().len()
    }

    pub fn is_complete(&self, token: GroupToken) -> bool {
        self.queue.is_retired(token)
    }
}

fn retire_group(stats: Option<&Stats>, token: GroupToken, copies: Vec<PendingCopy>) -> SimResult<()> {
    let count = copies.len() as u64;
    for copy in copies {
        trace!(id = %copy.id, "retire async copy");
        copy.dst.write_linear(copy.dst_offset, &copy.data)?;
    }
    if let Some(stats) = stats {
        Stats::bump(&stats.copies_retired, count);
        Stats::bump(&stats.groups_retired, 1);
    }
    debug!(%token, copies = count, "copy group complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AllocInit, ElemType, MemRefType, MemorySpace};

    fn buffers() -> (MemRef, MemRef) {
        let src = MemRef::alloc(
            &MemRefType::ranked(vec![8], ElemType::F32, MemorySpace::Global),
            AllocInit::Iota,
        )
        .unwrap();
        let dst = MemRef::alloc(
            &MemRefType::ranked(vec![8], ElemType::F32, MemorySpace::Shared),
            AllocInit::Fill(9.0),
        )
        .unwrap();
        (src, dst)
    }

    #[test]
    fn test_data_invisible_until_wait() {
        let (src, dst) = buffers();
        let mut unit = AsyncCopyUnit::new();
        let copy = unit.issue_copy(&src, &[4], &dst, &[0], 4, None, true).unwrap();
        let token = unit.create_group(&[copy]).unwrap();
        assert_eq!(dst.load(&[0]).unwrap(), 9.0);

        unit.wait(token, None).unwrap();
        assert_eq!(dst.to_vec()[..4], [4.0, 5.0, 6.0, 7.0]);
        assert!(unit.is_complete(token));
    }

    #[test]
    fn test_regroup_rejected() {
        let (src, dst) = buffers();
        let mut unit = AsyncCopyUnit::new();
        let copy = unit.issue_copy(&src, &[0], &dst, &[0], 2, None, false).unwrap();
        unit.create_group(&[copy]).unwrap();
        let err = unit.create_group(&[copy]).unwrap_err();
        assert!(matches!(
            err,
            SimError::Verify(VerifyError::DoubleGroupMembership(_))
        ));
    }

    #[test]
    fn test_unlisted_copies_swept() {
        let (src, dst) = buffers();
        let mut unit = AsyncCopyUnit::new();
        unit.issue_copy(&src, &[0], &dst, &[0], 2, None, false).unwrap();
        let token = unit.create_group(&[]).unwrap();
        assert_eq!(unit.ungrouped(), 0);
        unit.wait(token, Some(0)).unwrap();
        assert_eq!(dst.load(&[1]).unwrap(), 1.0);
    }
}
