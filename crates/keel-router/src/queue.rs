//! Priority order queue.
//!
//! Orders wait here between pipeline dispatch and execution. Ordering is
//! priority descending with FIFO ties (arrival sequence ascending), so
//! exit orders always pop before entries. Queued orders can be cancelled
//! by client id; cancellation of an already-popped order is a no-op here
//! because in-flight executions are left to complete.

use keel_core::{ClientOrderId, OrderRequest};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

struct QueuedOrder {
    order: OrderRequest,
    seq: u64,
}

impl PartialEq for QueuedOrder {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QueuedOrder {}

impl PartialOrd for QueuedOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older).
        self.order
            .priority
            .cmp(&other.order.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedOrder>,
    cancelled: HashSet<String>,
    next_seq: u64,
}

/// Concurrent priority queue of pending orders.
#[derive(Default)]
pub struct OrderQueue {
    inner: Mutex<Inner>,
}

impl OrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, order: OrderRequest) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedOrder { order, seq });
    }

    /// Pop the highest-priority order, skipping cancelled ones.
    pub fn pop(&self) -> Option<OrderRequest> {
        let mut inner = self.inner.lock();
        while let Some(queued) = inner.heap.pop() {
            let id = queued.order.id.as_str().to_string();
            if inner.cancelled.remove(&id) {
                continue;
            }
            return Some(queued.order);
        }
        None
    }

    /// Mark a queued order cancelled. Returns false when the id is not
    /// waiting in the queue (already in flight or unknown).
    pub fn cancel(&self, id: &ClientOrderId) -> bool {
        let mut inner = self.inner.lock();
        let waiting = inner.heap.iter().any(|q| q.order.id == *id);
        if waiting {
            inner.cancelled.insert(id.as_str().to_string());
        }
        waiting
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.heap.len() - inner.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{OrderSide, Size};
    use rust_decimal_macros::dec;

    fn order(symbol: &str, priority: u8) -> OrderRequest {
        OrderRequest::market(symbol, OrderSide::Buy, Size::new(dec!(1)), priority)
    }

    #[test]
    fn test_priority_ordering() {
        let queue = OrderQueue::new();
        queue.push(order("LOW", 0));
        queue.push(order("CRIT", 100));
        queue.push(order("MID", 50));

        assert_eq!(queue.pop().unwrap().symbol, "CRIT");
        assert_eq!(queue.pop().unwrap().symbol, "MID");
        assert_eq!(queue.pop().unwrap().symbol, "LOW");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = OrderQueue::new();
        queue.push(order("FIRST", 10));
        queue.push(order("SECOND", 10));
        queue.push(order("THIRD", 10));

        assert_eq!(queue.pop().unwrap().symbol, "FIRST");
        assert_eq!(queue.pop().unwrap().symbol, "SECOND");
        assert_eq!(queue.pop().unwrap().symbol, "THIRD");
    }

    #[test]
    fn test_cancel_queued_order() {
        let queue = OrderQueue::new();
        let victim = order("VICTIM", 50);
        let id = victim.id.clone();
        queue.push(victim);
        queue.push(order("KEEP", 10));

        assert!(queue.cancel(&id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().symbol, "KEEP");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_cancel_unknown_id() {
        let queue = OrderQueue::new();
        queue.push(order("A", 10));
        let other = order("B", 10);
        assert!(!queue.cancel(&other.id));
        assert_eq!(queue.len(), 1);
    }
}
