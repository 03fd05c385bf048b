//! Request/reply queues (§4.2): two ordered collections of in-flight reads,
//! with blocking dequeue and positional lookup. Grounded in
//! `kernel/queue.c`'s `dnbd_enq_request` / `dnbd_deq_request_handle` /
//! `dnbd_requeue_requests`, rebuilt over `std::sync::{Mutex, Condvar}`
//! instead of a spinlock + kernel wait queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::host::RequestRecord;

#[derive(Default)]
struct Inner {
    items: VecDeque<RequestRecord>,
    closed: bool,
}

/// An ordered collection of in-flight request records. Used for both the
/// client's tx-queue (pending to send) and rx-queue (awaiting reply).
/// Ordering within a queue is not observable to correctness (§4.2).
pub struct RequestQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue { inner: Mutex::new(Inner::default()), not_empty: Condvar::new() }
    }

    /// Pushes to the front and wakes one blocked popper.
    pub fn enqueue(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_front(record);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the queue is closed (shutdown).
    /// Returns `None` only once closed and drained.
    pub fn pop_blocking(&self) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(record) = inner.items.pop_back() {
                return Some(record);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop used by the retransmit timer context, which must
    /// never block.
    pub fn try_pop(&self) -> Option<RequestRecord> {
        self.inner.lock().unwrap().items.pop_back()
    }

    /// Removes the record whose byte position equals `pos`
    /// (`sector << 9 == pos`), if present.
    pub fn remove_by_pos(&self, pos: u64) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.items.iter().position(|r| r.pos() == pos)?;
        inner.items.remove(idx)
    }

    /// Moves every record whose `start_time` is strictly before `threshold`
    /// into `dest`, waking any blocked popper on `dest`. Returns the count
    /// moved.
    pub fn sweep_older_than(&self, threshold: u64, dest: &RequestQueue) -> usize {
        let mut moved = 0;
        let mut src = self.inner.lock().unwrap();
        let mut remaining = VecDeque::with_capacity(src.items.len());
        let mut stale = Vec::new();
        while let Some(record) = src.items.pop_front() {
            if record.start_time < threshold {
                stale.push(record);
            } else {
                remaining.push_back(record);
            }
        }
        src.items = remaining;
        drop(src);

        if !stale.is_empty() {
            let mut dst = dest.inner.lock().unwrap();
            for record in stale {
                dst.items.push_front(record);
                moved += 1;
            }
            if moved > 0 {
                dest.not_empty.notify_all();
            }
        }
        moved
    }

    /// Wakes all blocked poppers and marks the queue closed; subsequent
    /// `pop_blocking` calls drain remaining items then return `None`.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
    }

    /// Drains all remaining records, calling their completion callback with
    /// `success = false`. Used when tearing down on disconnect (§5).
    pub fn drain_with_error(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(mut record) = inner.items.pop_back() {
            (record.on_complete)(false, 0);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks with a timeout; used by the heartbeat loop so it can also
    /// observe shutdown without a separate poll.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(record) = inner.items.pop_back() {
                return Some(record);
            }
            if inner.closed {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::segment;

    fn record(sector: u64, start_time: u64) -> RequestRecord {
        RequestRecord {
            sector,
            sectors: 8,
            segments: vec![segment(4096)],
            start_time,
            on_complete: Box::new(|_, _| {}),
        }
    }

    #[test]
    fn enqueue_then_pop() {
        let q = RequestQueue::new();
        q.enqueue(record(0, 0));
        let r = q.pop_blocking().expect("item");
        assert_eq!(r.sector, 0);
    }

    #[test]
    fn remove_by_pos_matches_sector_times_512() {
        let q = RequestQueue::new();
        q.enqueue(record(16, 0));
        assert!(q.remove_by_pos(16 * 512).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn remove_by_pos_none_when_absent() {
        let q = RequestQueue::new();
        q.enqueue(record(16, 0));
        assert!(q.remove_by_pos(99 * 512).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn sweep_moves_stale_entries() {
        let tx = RequestQueue::new();
        let rx = RequestQueue::new();
        rx.enqueue(record(0, 10));
        rx.enqueue(record(8, 100));
        let moved = rx.sweep_older_than(50, &tx);
        assert_eq!(moved, 1);
        assert_eq!(rx.len(), 1);
        assert_eq!(tx.len(), 1);
        let remaining_in_rx = rx.try_pop().unwrap();
        assert_eq!(remaining_in_rx.sector, 8);
    }

    #[test]
    fn close_unblocks_pop() {
        let q = RequestQueue::new();
        q.close();
        assert!(q.pop_blocking().is_none());
    }
}
