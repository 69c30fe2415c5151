//! Lossless fan-out to every current subscriber.
//!
//! Each subscriber owns an unbounded queue, so a slow listener never loses
//! frames and sees them in the order they were sent.

use crate::util::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub(crate) struct Fanout<T> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Fanout<T> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receive everything sent from now on. Dropping the receiver
    /// unsubscribes.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Queue `value` for every live subscriber; returns how many got it.
    ///
    /// Sending under the lock keeps one order across all subscribers.
    pub(crate) fn send(&self, value: T) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_subscriber_keeps_everything_in_order() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe();

        for i in 0..10_000 {
            assert_eq!(fanout.send(i), 1);
        }

        for i in 0..10_000 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let fanout = Fanout::new();
        let kept = fanout.subscribe();
        drop(fanout.subscribe());

        assert_eq!(fanout.send("x"), 1);
        drop(kept);
        assert_eq!(fanout.send("y"), 0);
    }
}
