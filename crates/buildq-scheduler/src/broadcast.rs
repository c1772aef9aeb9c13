//! Fan-out of updates to any number of observers.
//!
//! Every consumer owns an independent channel and sees every message sent
//! after it registered. Publishing never blocks: a consumer that stops
//! reading accumulates a backlog, which is reported once it passes
//! [`SOFT_CAPACITY`], but no message is dropped for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::sync::{read_lock, write_lock};

/// Backlog above which a consumer is reported as lagging.
pub const SOFT_CAPACITY: usize = 100;

struct Slot<E> {
    tx: mpsc::UnboundedSender<E>,
    backlog: Arc<AtomicUsize>,
}

struct Shared<E> {
    consumers: RwLock<HashMap<u64, Slot<E>>>,
    next_id: AtomicU64,
}

impl<E> Shared<E> {
    fn deregister(&self, id: u64) -> bool {
        write_lock(&self.consumers).remove(&id).is_some()
    }
}

fn deliver<E>(id: u64, slot: &Slot<E>, msg: E) {
    if slot.tx.send(msg).is_err() {
        return;
    }
    let backlog = slot.backlog.fetch_add(1, Ordering::Relaxed) + 1;
    if backlog == SOFT_CAPACITY + 1 {
        warn!(consumer = id, backlog, "Observer is lagging behind updates");
    }
}

pub struct Broadcast<E> {
    shared: Arc<Shared<E>>,
}

impl<E: Clone + Send + 'static> Broadcast<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                consumers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn new_consumer(&self) -> BroadcastConsumer<E> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let slot = Slot {
            tx,
            backlog: Arc::clone(&backlog),
        };
        write_lock(&self.shared.consumers).insert(id, slot);
        BroadcastConsumer {
            id,
            shared: Arc::clone(&self.shared),
            rx,
            backlog,
        }
    }

    /// Deliver `msg` to every registered consumer.
    pub fn send(&self, msg: E) {
        let consumers = read_lock(&self.shared.consumers);
        for (id, slot) in consumers.iter() {
            deliver(*id, slot, msg.clone());
        }
    }

    pub fn has_consumer(&self) -> bool {
        self.len() > 0
    }

    pub fn len(&self) -> usize {
        read_lock(&self.shared.consumers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and remove all consumers. Their pending messages stay readable.
    pub fn close(&self) {
        write_lock(&self.shared.consumers).clear();
    }
}

impl<E: Clone + Send + 'static> Default for Broadcast<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of one broadcast registration. Deregisters on drop.
pub struct BroadcastConsumer<E> {
    id: u64,
    shared: Arc<Shared<E>>,
    rx: mpsc::UnboundedReceiver<E>,
    backlog: Arc<AtomicUsize>,
}

impl<E> BroadcastConsumer<E> {
    /// Next message, or `None` once the consumer or the broadcast is closed.
    pub async fn recv(&mut self) -> Option<E> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn try_recv(&mut self) -> Option<E> {
        let msg = self.rx.try_recv().ok();
        if msg.is_some() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    /// Deliver `msg` to this consumer only.
    pub fn post(&self, msg: E) {
        let consumers = read_lock(&self.shared.consumers);
        if let Some(slot) = consumers.get(&self.id) {
            deliver(self.id, slot, msg);
        }
    }

    /// Stop receiving. Idempotent.
    pub fn close(&self) {
        self.shared.deregister(self.id);
    }

    pub fn is_closed(&self) -> bool {
        !read_lock(&self.shared.consumers).contains_key(&self.id)
    }
}

impl<E> std::fmt::Debug for BroadcastConsumer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastConsumer")
            .field("id", &self.id)
            .finish()
    }
}

impl<E> Drop for BroadcastConsumer<E> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_consumer_sees_every_message() {
        let broadcast = Broadcast::new();
        let mut a = broadcast.new_consumer();
        let mut b = broadcast.new_consumer();

        broadcast.send(1);
        broadcast.send(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_late_consumer_misses_earlier_messages() {
        let broadcast = Broadcast::new();
        broadcast.send("lost");
        let mut c = broadcast.new_consumer();
        broadcast.send("seen");
        assert_eq!(c.recv().await, Some("seen"));
        assert_eq!(c.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_consumer_is_idempotent() {
        let broadcast = Broadcast::<u32>::new();
        let mut c = broadcast.new_consumer();
        assert!(broadcast.has_consumer());

        c.close();
        c.close();
        assert!(!broadcast.has_consumer());
        assert!(c.is_closed());
        assert_eq!(c.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_broadcast_ends_consumers() {
        let broadcast = Broadcast::new();
        let mut c = broadcast.new_consumer();
        broadcast.send(7);
        broadcast.close();

        assert_eq!(c.recv().await, Some(7));
        assert_eq!(c.recv().await, None);
        assert!(broadcast.is_empty());
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let broadcast = Broadcast::<u32>::new();
        {
            let _c = broadcast.new_consumer();
            assert_eq!(broadcast.len(), 1);
        }
        assert_eq!(broadcast.len(), 0);
    }

    #[tokio::test]
    async fn test_post_targets_one_consumer() {
        let broadcast = Broadcast::new();
        let mut a = broadcast.new_consumer();
        let mut b = broadcast.new_consumer();
        a.post("hello");
        assert_eq!(a.recv().await, Some("hello"));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn test_slow_consumer_never_blocks_publisher() {
        let broadcast = Broadcast::new();
        let mut c = broadcast.new_consumer();
        for i in 0..(SOFT_CAPACITY * 3) {
            broadcast.send(i);
        }
        let mut received = 0;
        while c.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SOFT_CAPACITY * 3);
    }

    #[test]
    fn test_recv_wakes_on_send() {
        let broadcast = Broadcast::new();
        let mut c = broadcast.new_consumer();
        let mut recv = tokio_test::task::spawn(c.recv());
        tokio_test::assert_pending!(recv.poll());

        broadcast.send(3);
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(3));
    }
}
