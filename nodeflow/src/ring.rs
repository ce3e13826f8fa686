//! Bounded in-memory history of recent flows. One writer, any number
//! of readers. Readers that fall more than a capacity behind get an
//! explicit lost count instead of a silent gap.

use std::sync::{Arc, RwLock};

use nodeflow_api::observer::v1::Flow;
use tokio::sync::watch;

pub struct Ring {
    inner: RwLock<Inner>,
    capacity: u64,
    // publishes the next write index so tails can sleep between writes
    write_idx: watch::Sender<u64>,
}

struct Inner {
    slots: Box<[Option<Arc<Flow>>]>,
    /// Index the next write will get; also the total number of writes.
    next: u64,
}

/// One read against the ring: the flows still present from the
/// requested range, and how many were already overwritten.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub flows: Vec<(u64, Arc<Flow>)>,
    pub lost: u64,
}

impl Ring {
    /// Capacity is rounded up to the next power of two so the slot
    /// index is a cheap mask.
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (write_idx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                slots: vec![None; capacity as usize].into_boxed_slice(),
                next: 0,
            }),
            capacity,
            write_idx,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of flows currently held: min(writes, capacity).
    pub fn len(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.next.min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of writes since start.
    pub fn seen(&self) -> u64 {
        self.inner.read().unwrap().next
    }

    /// Index of the oldest flow still present.
    pub fn oldest(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.next.saturating_sub(self.capacity)
    }

    /// Stores `flow` under the next write index, overwriting the oldest
    /// slot once full. Never blocks on readers being slow. Returns the
    /// index the flow was written at.
    pub fn write(&self, flow: Arc<Flow>) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let idx = inner.next;
        let slot = (idx & (self.capacity - 1)) as usize;
        inner.slots[slot] = Some(flow);
        inner.next = idx + 1;
        drop(inner);
        self.write_idx.send_replace(idx + 1);
        idx
    }

    /// Returns up to `max` flows with indices >= `start` that are still
    /// present, in index order, plus the count of requested indices
    /// that were already overwritten.
    pub fn read_from(&self, start: u64, max: usize) -> ReadResult {
        let inner = self.inner.read().unwrap();
        let next = inner.next;
        let oldest = next.saturating_sub(self.capacity);
        let begin = start.max(oldest);
        let lost = begin.saturating_sub(start).min(next.saturating_sub(start));
        let end = next.min(begin.saturating_add(max as u64));

        let mut flows = Vec::new();
        for idx in begin..end {
            let slot = (idx & (self.capacity - 1)) as usize;
            if let Some(flow) = &inner.slots[slot] {
                flows.push((idx, flow.clone()));
            }
        }
        ReadResult { flows, lost }
    }

    /// A cursor over the ring starting at `start`, clamped to the
    /// oldest index still present. The cursor waits for new writes once
    /// it catches up, and is restartable from any still-present index.
    pub fn tail(self: &Arc<Self>, start: u64) -> Tail {
        Tail {
            rx: self.write_idx.subscribe(),
            ring: self.clone(),
            next: start.max(self.oldest()),
        }
    }
}

pub struct Tail {
    ring: Arc<Ring>,
    rx: watch::Receiver<u64>,
    next: u64,
}

impl Tail {
    /// The index the next batch starts from.
    pub fn cursor(&self) -> u64 {
        self.next
    }

    /// Returns the next batch of at most `max` flows, sleeping until
    /// the ring advances when caught up. `None` once the writer is gone
    /// and everything present was delivered.
    pub async fn next_batch(&mut self, max: usize) -> Option<ReadResult> {
        loop {
            let result = self.ring.read_from(self.next, max);
            if !result.flows.is_empty() || result.lost > 0 {
                self.next = match result.flows.last() {
                    Some((idx, _)) => idx + 1,
                    None => self.next + result.lost,
                };
                return Some(result);
            }
            let caught_up = self.next;
            if self.rx.wait_for(|idx| *idx > caught_up).await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flow(seq: u32) -> Arc<Flow> {
        Arc::new(Flow {
            drop_reason: seq,
            ..Default::default()
        })
    }

    fn seqs(result: &ReadResult) -> Vec<u32> {
        result.flows.iter().map(|(_, f)| f.drop_reason).collect()
    }

    #[test]
    fn test_lost_count_after_wraparound() {
        let ring = Ring::new(4);
        for seq in 1..=10 {
            ring.write(flow(seq));
        }

        let result = ring.read_from(0, 100);
        assert_eq!(result.lost, 6);
        assert_eq!(seqs(&result), vec![7, 8, 9, 10]);
        // indices are strictly increasing
        let indices: Vec<u64> = result.flows.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_len_is_bounded_by_capacity() {
        let ring = Ring::new(4);
        assert_eq!(ring.len(), 0);
        assert!(ring.is_empty());

        for seq in 1..=3 {
            ring.write(flow(seq));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.seen(), 3);
        assert_eq!(ring.oldest(), 0);

        for seq in 4..=9 {
            ring.write(flow(seq));
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.seen(), 9);
        assert_eq!(ring.oldest(), 5);
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        assert_eq!(Ring::new(0).capacity(), 1);
        assert_eq!(Ring::new(3).capacity(), 4);
        assert_eq!(Ring::new(4).capacity(), 4);
        assert_eq!(Ring::new(4096).capacity(), 4096);
        assert_eq!(Ring::new(5000).capacity(), 8192);
    }

    #[test]
    fn test_read_from_future_index_is_empty() {
        let ring = Ring::new(4);
        ring.write(flow(1));

        let result = ring.read_from(5, 10);
        assert!(result.flows.is_empty());
        assert_eq!(result.lost, 0);
    }

    #[test]
    fn test_read_respects_max() {
        let ring = Ring::new(8);
        for seq in 1..=6 {
            ring.write(flow(seq));
        }

        let result = ring.read_from(0, 2);
        assert_eq!(seqs(&result), vec![1, 2]);
        let result = ring.read_from(2, 2);
        assert_eq!(seqs(&result), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_tail_wakes_on_write() {
        let ring = Arc::new(Ring::new(4));
        ring.write(flow(1));

        let mut tail = ring.tail(0);
        let first = tail.next_batch(16).await.unwrap();
        assert_eq!(seqs(&first), vec![1]);

        let writer = ring.clone();
        let handle = tokio::spawn(async move {
            writer.write(flow(2));
            writer.write(flow(3));
        });

        let second = tail.next_batch(16).await.unwrap();
        assert!(!second.flows.is_empty());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tail_reports_lost_when_lagging() {
        let ring = Arc::new(Ring::new(4));
        ring.write(flow(1));
        let mut tail = ring.tail(0);
        let first = tail.next_batch(16).await.unwrap();
        assert_eq!(first.lost, 0);

        // overrun the reader by a full capacity
        for seq in 2..=11 {
            ring.write(flow(seq));
        }

        let second = tail.next_batch(16).await.unwrap();
        assert_eq!(second.lost, 6);
        assert_eq!(seqs(&second), vec![8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_tail_starts_at_live_edge() {
        let ring = Arc::new(Ring::new(4));
        for seq in 1..=6 {
            ring.write(flow(seq));
        }

        let mut tail = ring.tail(ring.seen());
        ring.write(flow(7));
        let batch = tail.next_batch(16).await.unwrap();
        assert_eq!(batch.lost, 0);
        assert_eq!(seqs(&batch), vec![7]);
    }
}
