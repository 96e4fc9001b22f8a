//! The server's descriptor set.
//!
//! An index-stable arena: removing a connection frees its slot for reuse without relocating any
//! other entry, so a [`SlotId`] held across an await stays valid until that slot is removed.
//! Capacity starts small and doubles on demand, but never past the admission limit derived from
//! the process descriptor limit. A refused insert is the server's backpressure.

use std::io;
use std::task::{Context, Poll};

use thiserror::Error;

/// Descriptors kept back for stdio, the listener and the runtime's own handles.
pub const RESERVED_FDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("server is full at {limit} clients")]
pub struct Full {
    pub limit: usize,
}

#[derive(Debug)]
pub struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
    count: usize,
    capacity: usize,
    limit: usize,
    /// Where the next readiness scan starts, so early slots cannot starve later ones.
    cursor: usize,
}

impl<T> Slots<T> {
    pub fn new(initial_capacity: usize, limit: usize) -> Slots<T> {
        let capacity = initial_capacity.max(1).min(limit);
        Slots {
            entries: Vec::with_capacity(capacity),
            free: vec![],
            count: 0,
            capacity,
            limit,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Registers `value`, growing if needed. At the limit the value is handed back to be dropped.
    pub fn insert(&mut self, value: T) -> Result<SlotId, Full> {
        if self.count >= self.limit {
            return Err(Full { limit: self.limit });
        }
        if self.count == self.capacity {
            self.capacity = self.capacity.saturating_mul(2).min(self.limit);
            self.entries
                .reserve_exact(self.capacity.saturating_sub(self.entries.len()));
        }

        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(value);
                index
            }
            None => {
                self.entries.push(Some(value));
                self.entries.len() - 1
            }
        };
        self.count += 1;
        Ok(SlotId(index))
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let value = self.entries.get_mut(id.0).and_then(Option::take)?;
        self.free.push(id.0);
        self.count -= 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.entries.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.entries.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Snapshot of the occupied slots. Safe to hold while slots are removed.
    pub fn ids(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .map(|(index, _)| SlotId(index))
            .collect()
    }

    /// Level-triggered readiness scan: polls every occupied slot once, starting after the slot
    /// that was ready last time, and returns the first one that is ready.
    pub fn poll_ready<R, F>(&mut self, cx: &mut Context, mut poll: F) -> Poll<(SlotId, R)>
    where
        F: FnMut(&mut T, &mut Context) -> Poll<R>,
    {
        let len = self.entries.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            if let Some(entry) = self.entries[index].as_mut() {
                if let Poll::Ready(out) = poll(entry, cx) {
                    self.cursor = index + 1;
                    return Poll::Ready((SlotId(index), out));
                }
            }
        }
        Poll::Pending
    }
}

/// The soft descriptor limit of this process minus [`RESERVED_FDS`].
pub fn descriptor_limit() -> io::Result<usize> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct it is handed.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let soft = if rl.rlim_cur == libc::RLIM_INFINITY {
        usize::MAX
    } else {
        rl.rlim_cur as usize
    };
    Ok(soft.saturating_sub(RESERVED_FDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn capacity_doubles_up_to_limit() {
        let mut slots = Slots::new(5, 12);
        for i in 0..5 {
            slots.insert(i).unwrap();
        }
        assert_eq!(slots.capacity(), 5);
        slots.insert(5).unwrap();
        assert_eq!(slots.capacity(), 10);
        for i in 6..11 {
            slots.insert(i).unwrap();
        }
        assert_eq!(slots.capacity(), 12);
    }

    #[test]
    fn joins_past_limit_are_all_refused() {
        let mut slots = Slots::new(2, 7);
        let mut refused = 0;
        for i in 0..100 {
            match slots.insert(i) {
                Ok(_) => {}
                Err(full) => {
                    assert_eq!(full, Full { limit: 7 });
                    refused += 1;
                }
            }
            assert!(slots.len() <= slots.limit());
            assert!(slots.len() <= slots.capacity());
        }
        assert_eq!(refused, 93);
        assert_eq!(slots.len(), 7);
    }

    #[test]
    fn removal_keeps_other_ids_stable() {
        let mut slots = Slots::new(4, 10);
        let a = slots.insert("a").unwrap();
        let b = slots.insert("b").unwrap();
        let c = slots.insert("c").unwrap();

        assert_eq!(slots.remove(a), Some("a"));
        assert_eq!(slots.remove(a), None);
        assert_eq!(slots.get(b), Some(&"b"));
        assert_eq!(slots.get(c), Some(&"c"));
        assert_eq!(slots.ids(), vec![b, c]);

        let d = slots.insert("d").unwrap();
        assert_eq!(d, a);
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn removal_frees_admission() {
        let mut slots = Slots::new(1, 1);
        assert!(slots.is_empty());
        let a = slots.insert(1).unwrap();
        assert!(!slots.is_empty());
        assert!(slots.insert(2).is_err());
        slots.remove(a);
        assert!(slots.insert(3).is_ok());
    }

    #[test]
    fn readiness_scan_rotates() {
        let mut slots = Slots::new(4, 10);
        let a = slots.insert(()).unwrap();
        let b = slots.insert(()).unwrap();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut ready = |slots: &mut Slots<()>| match slots.poll_ready(&mut cx, |_, _| Poll::Ready(())) {
            Poll::Ready((id, ())) => id,
            Poll::Pending => panic!("nothing ready"),
        };
        assert_eq!(ready(&mut slots), a);
        assert_eq!(ready(&mut slots), b);
        assert_eq!(ready(&mut slots), a);
    }

    #[test]
    fn empty_set_is_pending() {
        let mut slots: Slots<()> = Slots::new(4, 10);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(slots.poll_ready(&mut cx, |_, _| Poll::Ready(())).is_pending());
    }

    #[test]
    fn descriptor_limit_is_positive() {
        assert!(descriptor_limit().unwrap() > 0);
    }
}
