//! Inbound delivery buffer.
//!
//! Every raw inbound payload is stamped with `now + latency` on arrival and
//! only released once the processing tick reaches that time. With zero
//! latency this is a plain FIFO that decouples socket callbacks from the
//! tick; with a positive latency it simulates a slower link.
//!
//! Owned by the session and touched only from the tick.

use std::collections::VecDeque;

use netsync_shared::clock::Millis;

#[derive(Debug)]
struct Pending<T> {
    ready_at: Millis,
    item: T,
}

#[derive(Debug)]
pub struct DeliveryBuffer<T> {
    latency_ms: Millis,
    queue: VecDeque<Pending<T>>,
}

impl<T> DeliveryBuffer<T> {
    pub fn new(latency_ms: Millis) -> Self {
        Self {
            latency_ms: latency_ms.max(0.0),
            queue: VecDeque::new(),
        }
    }

    pub fn latency_ms(&self) -> Millis {
        self.latency_ms
    }

    /// Changes the delay for messages pushed from now on.
    pub fn set_latency_ms(&mut self, latency_ms: Millis) {
        self.latency_ms = latency_ms.max(0.0);
    }

    /// Enqueues `item`, due at `now + latency`.
    pub fn push(&mut self, now: Millis, item: T) {
        self.queue.push_back(Pending {
            ready_at: now + self.latency_ms,
            item,
        });
    }

    /// Removes and returns every due item, in push order.
    ///
    /// Items that are not yet due stay queued even if a later push is due,
    /// which can only happen after the latency was lowered.
    pub fn drain(&mut self, now: Millis) -> Vec<T> {
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        for pending in self.queue.drain(..) {
            if pending.ready_at <= now {
                ready.push(pending.item);
            } else {
                waiting.push_back(pending);
            }
        }
        self.queue = waiting;
        ready
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_due_items_in_push_order() {
        let mut buf = DeliveryBuffer::new(100.0);
        buf.push(0.0, "a");
        buf.push(10.0, "b");
        buf.push(50.0, "c");

        assert!(buf.drain(99.0).is_empty());
        assert_eq!(buf.drain(110.0), vec!["a", "b"]);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.drain(1000.0), vec!["c"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn never_returns_an_item_twice() {
        let mut buf = DeliveryBuffer::new(0.0);
        for i in 0..5 {
            buf.push(i as f64, i);
        }
        let mut seen = buf.drain(10.0);
        seen.extend(buf.drain(10.0));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn zero_latency_is_ready_immediately() {
        let mut buf = DeliveryBuffer::new(0.0);
        buf.push(5.0, 1);
        assert_eq!(buf.drain(5.0), vec![1]);
    }

    #[test]
    fn lowered_latency_keeps_order_among_due_items() {
        let mut buf = DeliveryBuffer::new(100.0);
        buf.push(0.0, "slow");
        buf.set_latency_ms(0.0);
        buf.push(1.0, "fast");
        assert_eq!(buf.drain(1.0), vec!["fast"]);
        assert_eq!(buf.drain(100.0), vec!["slow"]);
    }

    #[test]
    fn negative_latency_is_clamped() {
        let buf = DeliveryBuffer::<u8>::new(-5.0);
        assert_eq!(buf.latency_ms(), 0.0);
    }
}
