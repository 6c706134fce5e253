use std::collections::VecDeque;

/// Bounded FIFO of events awaiting a connection. Overflow drops the oldest
/// entry and counts it.
#[derive(Debug)]
pub(crate) struct Outbox<T> {
    queue: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> Outbox<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(item);
    }

    /// Takes every queued item, oldest first, and the drop count since the
    /// last drain.
    pub(crate) fn drain(&mut self) -> (Vec<T>, u64) {
        let items = self.queue.drain(..).collect();
        (items, std::mem::take(&mut self.dropped))
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let mut outbox = Outbox::new(100);
        for i in 0..150 {
            outbox.push(i);
        }
        assert_eq!(outbox.len(), 100);
        assert_eq!(outbox.dropped(), 50);

        let (items, dropped) = outbox.drain();
        assert_eq!(dropped, 50);
        assert_eq!(items.first(), Some(&50));
        assert_eq!(items.last(), Some(&149));
        assert_eq!(outbox.len(), 0);
        assert_eq!(outbox.dropped(), 0);
    }

    #[test]
    fn zero_capacity_counts_everything_as_dropped() {
        let mut outbox = Outbox::new(0);
        outbox.push("a");
        outbox.push("b");
        let (items, dropped) = outbox.drain();
        assert!(items.is_empty());
        assert_eq!(dropped, 2);
    }
}
