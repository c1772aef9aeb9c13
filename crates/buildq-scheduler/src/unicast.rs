//! Reliable single-delivery work queue.
//!
//! Items wait in FIFO order until a consumer whose owner passes the
//! selection callback becomes available. A consumer holds at most one
//! unacknowledged item. Acknowledging makes it available again; closing it
//! without acknowledging puts the item back in the queue, so every item is
//! either pending, in flight with exactly one consumer, or done.
//!
//! Callbacks run with the queue lock held and must not call back into the
//! same queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use buildq_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{trace, warn};

use crate::sync;

/// Capacity of each consumer's delivery channel.
pub const CONSUMER_CAPACITY: usize = 100;

/// Hooks deciding which consumer may take which item.
pub trait UnicastCallbacks<E, O>: Send + Sync {
    /// May `owner` take `item`?
    fn select(&self, item: &E, owner: &O) -> bool;

    /// `item` was handed to `owner`.
    fn selected(&self, item: &E, owner: &O);

    /// `item` was taken back from `owner` without acknowledgement.
    fn not_selected(&self, item: &E, owner: &O);
}

struct ConsumerSlot<E, O> {
    owner: O,
    tx: mpsc::Sender<E>,
    token: CancellationToken,
}

struct State<E, O> {
    consumers: HashMap<u64, ConsumerSlot<E, O>>,
    available: HashSet<u64>,
    in_flight: HashMap<u64, E>,
    queue: VecDeque<E>,
}

struct Shared<E, O> {
    callbacks: Arc<dyn UnicastCallbacks<E, O>>,
    state: Mutex<State<E, O>>,
    next_id: AtomicU64,
}

impl<E, O> Shared<E, O>
where
    E: Clone + PartialEq + Send + 'static,
    O: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<E, O>> {
        sync::lock(&self.state)
    }

    /// Hand at most one pending item to one available consumer.
    fn dispatch(&self, state: &mut State<E, O>) {
        let available: Vec<u64> = state.available.iter().copied().collect();
        for id in available {
            let Some(slot) = state.consumers.get(&id) else {
                continue;
            };
            let Some(index) = state
                .queue
                .iter()
                .position(|item| self.callbacks.select(item, &slot.owner))
            else {
                continue;
            };
            let Some(item) = state.queue.remove(index) else {
                continue;
            };

            state.available.remove(&id);
            state.in_flight.insert(id, item.clone());
            self.callbacks.selected(&item, &slot.owner);

            if let Err(err) = slot.tx.try_send(item) {
                warn!(consumer = id, error = %err, "Dropped unicast delivery");
            } else {
                trace!(consumer = id, "Delivered unicast item");
            }
            return;
        }
    }

    fn acknowledge(&self, id: u64) {
        let mut state = self.lock();
        if !state.consumers.contains_key(&id) {
            return;
        }
        state.in_flight.remove(&id);
        state.available.insert(id);
        self.dispatch(&mut state);
    }

    fn remove(&self, id: u64) {
        let mut state = self.lock();
        let Some(slot) = state.consumers.remove(&id) else {
            return;
        };
        state.available.remove(&id);
        if let Some(item) = state.in_flight.remove(&id) {
            self.callbacks.not_selected(&item, &slot.owner);
            state.queue.push_back(item);
        }
        // Dropping the slot closes the consumer's channel.
        drop(slot);
        self.dispatch(&mut state);
    }
}

pub struct Unicast<E, O> {
    shared: Arc<Shared<E, O>>,
}

impl<E, O> Unicast<E, O>
where
    E: Clone + PartialEq + Send + 'static,
    O: Send + 'static,
{
    pub fn new(callbacks: Arc<dyn UnicastCallbacks<E, O>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                callbacks,
                state: Mutex::new(State {
                    consumers: HashMap::new(),
                    available: HashSet::new(),
                    in_flight: HashMap::new(),
                    queue: VecDeque::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue `item` unless an equal item is already pending or in flight.
    /// Returns false for duplicates.
    pub fn send(&self, item: E) -> bool {
        let mut state = self.shared.lock();
        if state.queue.contains(&item) || state.in_flight.values().any(|i| *i == item) {
            return false;
        }
        state.queue.push_back(item);
        self.shared.dispatch(&mut state);
        true
    }

    /// Register an available consumer for `owner`.
    pub fn new_consumer(&self, owner: O) -> UnicastConsumer<E, O> {
        let mut state = self.shared.lock();
        let (consumer, slot) = self.make_consumer(owner);
        state.consumers.insert(consumer.id, slot);
        state.available.insert(consumer.id);
        self.shared.dispatch(&mut state);
        consumer
    }

    /// Register a consumer only if some pending item is selectable by
    /// `owner`. That item is delivered to the new consumer immediately.
    pub fn new_consumer_with_item(&self, owner: O) -> Result<UnicastConsumer<E, O>> {
        let mut state = self.shared.lock();
        let index = state
            .queue
            .iter()
            .position(|item| self.shared.callbacks.select(item, &owner))
            .ok_or_else(|| Error::NotFound("no selectable item".to_string()))?;
        let item = state
            .queue
            .remove(index)
            .ok_or_else(|| Error::Internal("unicast queue changed under lock".to_string()))?;

        let (consumer, slot) = self.make_consumer(owner);
        self.shared.callbacks.selected(&item, &slot.owner);
        state.in_flight.insert(consumer.id, item.clone());
        if let Err(err) = slot.tx.try_send(item) {
            warn!(consumer = consumer.id, error = %err, "Dropped unicast delivery");
        }
        state.consumers.insert(consumer.id, slot);
        Ok(consumer)
    }

    fn make_consumer(&self, owner: O) -> (UnicastConsumer<E, O>, ConsumerSlot<E, O>) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONSUMER_CAPACITY);
        let token = CancellationToken::new();
        let consumer = UnicastConsumer {
            id,
            shared: Arc::clone(&self.shared),
            rx: tokio::sync::Mutex::new(rx),
            token: token.clone(),
        };
        (consumer, ConsumerSlot { owner, tx, token })
    }

    /// Visit pending items in queue order until `visit` returns false.
    /// Returns false if the walk was cut short.
    pub fn walk<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&E) -> bool,
    {
        let state = self.shared.lock();
        state.queue.iter().all(|item| visit(item))
    }

    /// First pending item matching `pred`.
    pub fn find<F>(&self, pred: F) -> Option<E>
    where
        F: Fn(&E) -> bool,
    {
        let state = self.shared.lock();
        state.queue.iter().find(|item| pred(item)).cloned()
    }

    /// Drop a pending item. In-flight items are not affected.
    pub fn remove(&self, item: &E) -> bool {
        let mut state = self.shared.lock();
        match state.queue.iter().position(|i| i == item) {
            Some(index) => state.queue.remove(index).is_some(),
            None => false,
        }
    }

    /// Snapshot of pending items.
    pub fn pending(&self) -> Vec<E> {
        self.shared.lock().queue.iter().cloned().collect()
    }

    /// Snapshot of delivered, unacknowledged items.
    pub fn unacked(&self) -> Vec<E> {
        self.shared.lock().in_flight.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn has_unacked_data(&self) -> bool {
        !self.shared.lock().in_flight.is_empty()
    }

    pub fn num_unacked_data(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn num_consumers(&self) -> usize {
        self.shared.lock().consumers.len()
    }

    /// Cancel every consumer. Consumers deregister when they close.
    pub fn close(&self) {
        let state = self.shared.lock();
        for slot in state.consumers.values() {
            slot.token.cancel();
        }
    }
}

/// One registered consumer. Closes itself on drop.
pub struct UnicastConsumer<E, O>
where
    E: Clone + PartialEq + Send + 'static,
    O: Send + 'static,
{
    id: u64,
    shared: Arc<Shared<E, O>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<E>>,
    token: CancellationToken,
}

impl<E, O> UnicastConsumer<E, O>
where
    E: Clone + PartialEq + Send + 'static,
    O: Send + 'static,
{
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next delivered item, or `None` once the consumer is closed.
    pub async fn recv(&self) -> Option<E> {
        self.rx.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<E> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Mark the current item done and become available again.
    pub fn acknowledge(&self) {
        self.shared.acknowledge(self.id);
    }

    pub fn unacknowledged(&self) -> Option<E> {
        self.shared.lock().in_flight.get(&self.id).cloned()
    }

    /// Deregister, returning any unacknowledged item to the queue. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
        self.shared.remove(self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the consumer or its queue is closed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl<E, O> Drop for UnicastConsumer<E, O>
where
    E: Clone + PartialEq + Send + 'static,
    O: Send + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Owners select items by first character; `*` takes anything.
    #[derive(Default)]
    struct Prefix {
        selected: AtomicUsize,
        not_selected: AtomicUsize,
    }

    impl UnicastCallbacks<String, char> for Prefix {
        fn select(&self, item: &String, owner: &char) -> bool {
            *owner == '*' || item.starts_with(*owner)
        }

        fn selected(&self, _item: &String, _owner: &char) {
            self.selected.fetch_add(1, Ordering::Relaxed);
        }

        fn not_selected(&self, _item: &String, _owner: &char) {
            self.not_selected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn unicast() -> (Unicast<String, char>, Arc<Prefix>) {
        let callbacks = Arc::new(Prefix::default());
        (Unicast::new(callbacks.clone()), callbacks)
    }

    async fn next(c: &UnicastConsumer<String, char>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), c.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_two_consumers_and_redelivery() {
        let (queue, callbacks) = unicast();
        let c1 = queue.new_consumer('*');
        let c2 = queue.new_consumer('*');

        queue.send("a".to_string());
        queue.send("b".to_string());
        queue.send("c".to_string());

        let mut got = vec![c1.try_recv(), c2.try_recv()];
        got.sort();
        assert_eq!(got, vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_unacked_data(), 2);

        // c1 leaves without acknowledging: its item goes back behind "c".
        let c1_item = c1.unacknowledged().unwrap();
        c1.close();
        assert_eq!(callbacks.not_selected.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pending(), vec!["c".to_string(), c1_item.clone()]);

        c2.acknowledge();
        assert_eq!(next(&c2).await, Some("c".to_string()));
        c2.acknowledge();
        assert_eq!(next(&c2).await, Some(c1_item));
        c2.acknowledge();
        assert!(queue.is_empty());
        assert!(!queue.has_unacked_data());
        assert_eq!(callbacks.selected.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_one_item_in_flight_per_consumer() {
        let (queue, _) = unicast();
        let c = queue.new_consumer('*');
        queue.send("a".to_string());
        queue.send("b".to_string());

        assert_eq!(next(&c).await, Some("a".to_string()));
        assert_eq!(c.try_recv(), None);
        c.acknowledge();
        assert_eq!(next(&c).await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_send_is_ignored() {
        let (queue, _) = unicast();
        assert!(queue.send("a".to_string()));
        assert!(!queue.send("a".to_string()));
        assert_eq!(queue.len(), 1);

        let c = queue.new_consumer('*');
        assert_eq!(next(&c).await, Some("a".to_string()));

        // Still in flight.
        assert!(!queue.send("a".to_string()));
        assert!(queue.is_empty());

        c.acknowledge();
        assert!(queue.send("a".to_string()));
    }

    #[tokio::test]
    async fn test_selection_skips_ineligible_items() {
        let (queue, _) = unicast();
        queue.send("x1".to_string());
        queue.send("y1".to_string());

        let y = queue.new_consumer('y');
        assert_eq!(next(&y).await, Some("y1".to_string()));
        assert_eq!(queue.pending(), vec!["x1".to_string()]);
    }

    #[tokio::test]
    async fn test_new_consumer_with_item() {
        let (queue, _) = unicast();
        assert!(queue.new_consumer_with_item('x').is_err());
        assert_eq!(queue.num_consumers(), 0);

        queue.send("x1".to_string());
        let c = queue.new_consumer_with_item('x').unwrap();
        assert_eq!(c.unacknowledged(), Some("x1".to_string()));
        assert_eq!(next(&c).await, Some("x1".to_string()));

        drop(c);
        assert_eq!(queue.pending(), vec!["x1".to_string()]);
        assert_eq!(queue.num_consumers(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_cancels() {
        let (queue, _) = unicast();
        let c = queue.new_consumer('*');
        queue.close();
        assert!(c.is_cancelled());

        c.close();
        assert_eq!(next(&c).await, None);
    }

    #[tokio::test]
    async fn test_walk_and_remove() {
        let (queue, _) = unicast();
        for s in ["a", "b", "c"] {
            queue.send(s.to_string());
        }
        let mut seen = Vec::new();
        let complete = queue.walk(|item| {
            seen.push(item.clone());
            item != "b"
        });
        assert!(!complete);
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

        assert!(queue.remove(&"b".to_string()));
        assert!(!queue.remove(&"b".to_string()));
        assert_eq!(queue.find(|i| i.starts_with('c')), Some("c".to_string()));
    }
}
