//! Sealed-group queue
//!
//! Work is pushed into an open group, sealed in creation order and retired
//! strictly oldest-first. Both the async-copy unit and the warp-group MMA
//! unit track their outstanding work with it.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Position of a sealed group in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupToken {
    seq: u64,
}

impl GroupToken {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for GroupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.seq)
    }
}

/// Queue of sealed groups
#[derive(Debug)]
pub struct GroupQueue<T> {
    next_seq: u64,
    open: Vec<T>,
    sealed: VecDeque<(GroupToken, Vec<T>)>,
}

impl<T> Default for GroupQueue<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            open: Vec::new(),
            sealed: VecDeque::new(),
        }
    }
}

impl<T> GroupQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add work to the open group
    pub fn push(&mut self, item: T) {
        self.open.push(item);
    }

    /// Work not yet sealed into a group
    pub fn open(&self) -> &[T] {
        &self.open
    }

    /// Seal the open group (possibly empty) and return its token
    pub fn seal(&mut self) -> GroupToken {
        let token = GroupToken { seq: self.next_seq };
        self.next_seq += 1;
        let items = std::mem::take(&mut self.open);
        self.sealed.push_back((token, items));
        token
    }

    /// Sealed groups not yet retired
    pub fn outstanding(&self) -> usize {
        self.sealed.len()
    }

    /// Outstanding groups created at or before `token`
    pub fn outstanding_through(&self, token: GroupToken) -> usize {
        self.sealed.iter().take_while(|(t, _)| *t <= token).count()
    }

    /// Whether `token` was sealed by this queue
    pub fn is_issued(&self, token: GroupToken) -> bool {
        token.seq < self.next_seq
    }

    pub fn is_retired(&self, token: GroupToken) -> bool {
        self.is_issued(token) && self.sealed.iter().all(|(t, _)| *t != token)
    }

    /// Remove the oldest sealed group
    pub fn retire_oldest(&mut self) -> Option<(GroupToken, Vec<T>)> {
        self.sealed.pop_front()
    }

    /// Retire oldest-first until at most `max_outstanding` groups at or
    /// before `token` remain; returns how many groups were retired
    pub fn wait<E>(
        &mut self,
        token: GroupToken,
        max_outstanding: usize,
        mut retire: impl FnMut(GroupToken, Vec<T>) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut retired = 0;
        while self.outstanding_through(token) > max_outstanding {
            match self.sealed.pop_front() {
                Some((t, items)) => {
                    retire(t, items)?;
                    retired += 1;
                }
                None => break,
            }
        }
        Ok(retired)
    }

    /// Retire oldest-first until at most `max_outstanding` groups remain
    pub fn drain_to<E>(
        &mut self,
        max_outstanding: usize,
        mut retire: impl FnMut(GroupToken, Vec<T>) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut retired = 0;
        while self.sealed.len() > max_outstanding {
            if let Some((t, items)) = self.sealed.pop_front() {
                retire(t, items)?;
                retired += 1;
            }
        }
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_tokens_ordered() {
        let mut q: GroupQueue<u32> = GroupQueue::new();
        q.push(1);
        let a = q.seal();
        let b = q.seal();
        assert!(a < b);
        assert_eq!(q.outstanding(), 2);
        assert_eq!(q.outstanding_through(a), 1);
    }

    #[test]
    fn test_wait_retires_in_order() {
        let mut q: GroupQueue<u32> = GroupQueue::new();
        q.push(1);
        let a = q.seal();
        q.push(2);
        let b = q.seal();

        let mut seen = Vec::new();
        q.wait::<Infallible>(b, 1, |t, items| {
            seen.push((t, items));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(a, vec![1])]);
        assert!(q.is_retired(a));
        assert!(!q.is_retired(b));
    }
}
