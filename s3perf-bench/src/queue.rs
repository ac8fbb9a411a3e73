//! Hand-off of listed objects from the listing producer to the scan dispatcher.
//!
//! The queue is an unbounded channel with explicit close semantics: [`WorkQueue::pop`] only yields
//! `None` once the [`WorkProducer`] has been closed (or dropped) *and* every buffered item has
//! been taken. Consumers therefore never observe a "listing complete but items still pending"
//! state, and never need to poll a completion flag next to a length check.

use tokio::sync::mpsc;

/// Creates a connected producer and queue.
pub fn work_queue<T>() -> (WorkProducer<T>, WorkQueue<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (WorkProducer { sender }, WorkQueue { receiver })
}

/// The sending half of a [`WorkQueue`].
#[derive(Debug)]
pub struct WorkProducer<T> {
    sender: mpsc::UnboundedSender<T>,
}

/// The queue was dropped, so pushed items can never be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("work queue has no consumer")]
pub struct QueueClosed;

impl<T> WorkProducer<T> {
    /// Appends an item to the queue. This never blocks.
    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.sender.send(item).map_err(|_| QueueClosed)
    }

    /// Appends all items in order, returning how many were pushed.
    pub fn push_all(&self, items: impl IntoIterator<Item = T>) -> Result<usize, QueueClosed> {
        let mut count = 0;
        for item in items {
            self.push(item)?;
            count += 1;
        }
        Ok(count)
    }

    /// Signals that no further items will be produced.
    ///
    /// Dropping the producer has the same effect.
    pub fn close(self) {
        drop(self.sender);
    }
}

/// The receiving half, drained by the dispatch loop.
#[derive(Debug)]
pub struct WorkQueue<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> WorkQueue<T> {
    /// Takes the next item, waiting for the producer if the queue is currently empty.
    ///
    /// Returns `None` once the producer is closed and the queue is drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns `true` if no items are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drains_buffered_items_after_close() {
        let (producer, mut queue) = work_queue();
        assert_eq!(producer.push_all([1, 2, 3]).unwrap(), 3);
        producer.close();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let (producer, mut queue) = work_queue();

        {
            let mut pop = Box::pin(queue.pop());
            assert!(futures::poll!(&mut pop).is_pending());

            producer.push("item").unwrap();
            assert_eq!(pop.await, Some("item"));
        }

        drop(producer);
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn push_fails_without_consumer() {
        let (producer, queue) = work_queue();
        drop(queue);
        assert_eq!(producer.push(1), Err(QueueClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interleaved_production_loses_nothing() {
        let (producer, mut queue) = work_queue();

        let production = tokio::spawn(async move {
            for page in 0..3 {
                let items = (0..10).map(|i| page * 10 + i);
                producer.push_all(items).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let mut seen = Vec::new();
        while let Some(item) = queue.pop().await {
            seen.push(item);
        }
        production.await.unwrap();

        assert_eq!(seen, (0..30).collect::<Vec<_>>());
    }
}
