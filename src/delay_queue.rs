//! Time-ordered holding area for transfers submitted with a future due time
//! (spec §4.1 "DelayQueue", §4.5 "deferred submissions").

use crate::transfer::AnyTransfer;
use std::time::Instant;

struct Entry {
    transfer: AnyTransfer,
    front_insert: bool,
    due: Instant,
}

/// Unsorted on insert, sorted lazily on [`DelayQueue::process`]. A `dirty`
/// flag avoids re-sorting on every insert when several transfers are
/// deferred back-to-back (e.g. a crawl seeding its first page of links).
#[derive(Default)]
pub struct DelayQueue {
    entries: Vec<Entry>,
    sorted: bool,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            sorted: true,
        }
    }

    pub fn push(&mut self, transfer: AnyTransfer, front_insert: bool, due: Instant) {
        self.entries.push(Entry {
            transfer,
            front_insert,
            due,
        });
        self.sorted = false;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.entries.sort_by_key(|e| e.due);
            self.sorted = true;
        }
    }

    /// Promotes every entry whose due time has passed into `backlog`
    /// (honoring `front_insert`), and returns the delay in microseconds
    /// until the next remaining entry becomes due, or `None` if the queue
    /// is now empty (spec §4.5 "process delay queue").
    pub fn process(&mut self, now: Instant, backlog: &mut super::backlog::Backlog) -> Option<u64> {
        self.ensure_sorted();
        let split_at = self.entries.partition_point(|e| e.due <= now);
        let due_now: Vec<Entry> = self.entries.drain(..split_at).collect();
        for entry in due_now {
            if entry.front_insert {
                backlog.push_front(entry.transfer);
            } else {
                backlog.push_back(entry.transfer);
            }
        }
        self.entries
            .first()
            .map(|e| e.due.saturating_duration_since(now).as_micros() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Backlog;
    use crate::transfer::HttpTransfer;
    use std::time::Duration;

    fn transfer(url: &str) -> AnyTransfer {
        AnyTransfer::Http(HttpTransfer::new(url))
    }

    #[test]
    fn promotes_due_entries_in_submission_order() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(transfer("http://a"), false, now - Duration::from_secs(1));
        q.push(transfer("http://b"), false, now - Duration::from_millis(500));
        let mut backlog = Backlog::new();
        let next_delay = q.process(now, &mut backlog);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.pop_front().unwrap().url(), "http://a");
        assert_eq!(backlog.pop_front().unwrap().url(), "http://b");
        assert!(next_delay.is_none());
    }

    #[test]
    fn leaves_future_entries_queued_and_reports_next_delay() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        q.push(transfer("http://future"), false, now + Duration::from_millis(50));
        let mut backlog = Backlog::new();
        let next_delay = q.process(now, &mut backlog);
        assert!(backlog.is_empty());
        assert!(next_delay.is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn front_insert_flag_is_honored() {
        let mut q = DelayQueue::new();
        let now = Instant::now();
        let mut backlog = Backlog::new();
        backlog.push_back(transfer("http://existing"));
        q.push(transfer("http://deferred"), true, now - Duration::from_millis(1));
        q.process(now, &mut backlog);
        assert_eq!(backlog.pop_front().unwrap().url(), "http://deferred");
    }
}
