//! Binary heap with caller supplied ordering and identity.
//!
//! `std::collections::BinaryHeap` requires `Ord` on the element and offers
//! no removal by identity. The ready-build queue needs both: builds are
//! ordered by (priority, scheduled-at) and leave the queue when they run
//! out of dispatchable work.

use std::cmp::Ordering;

type CompareFn<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;
type EqualsFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Min-heap: `compare(a, b) == Less` puts `a` before `b`.
pub struct PriorityQueue<T> {
    items: Vec<T>,
    compare: CompareFn<T>,
    equals: EqualsFn<T>,
}

impl<T> PriorityQueue<T> {
    pub fn new<C, E>(compare: C, equals: E) -> Self
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            items: Vec::new(),
            compare: Box::new(compare),
            equals: Box::new(equals),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let item = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        item
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.position(item).is_some()
    }

    /// Remove the first element equal to `item`.
    pub fn remove(&mut self, item: &T) -> Option<T> {
        let index = self.position(item)?;
        let last = self.items.len() - 1;
        self.items.swap(index, last);
        let removed = self.items.pop();
        if index < self.items.len() {
            self.fix(index);
        }
        removed
    }

    /// Elements in heap order. Only the first is guaranteed to be the minimum.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Re-establish the heap invariant after element keys changed in place.
    pub fn reorder(&mut self) {
        let n = self.items.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i);
        }
    }

    /// Snapshot of all elements in full priority order.
    pub fn sorted(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut items = self.items.clone();
        items.sort_by(|a, b| (self.compare)(a, b));
        items
    }

    fn position(&self, item: &T) -> Option<usize> {
        self.items.iter().position(|x| (self.equals)(x, item))
    }

    fn less(&self, i: usize, j: usize) -> bool {
        (self.compare)(&self.items[i], &self.items[j]) == Ordering::Less
    }

    fn fix(&mut self, index: usize) {
        if !self.sift_down(index) {
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    /// Returns true if the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.items.len();
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, index) {
                break;
            }
            self.items.swap(index, child);
            index = child;
        }
        index > start
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("items", &self.items)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Job {
        name: &'static str,
        priority: i32,
    }

    fn queue() -> PriorityQueue<Job> {
        // Higher priority first.
        PriorityQueue::new(
            |a: &Job, b: &Job| b.priority.cmp(&a.priority),
            |a: &Job, b: &Job| a.name == b.name,
        )
    }

    fn job(name: &'static str, priority: i32) -> Job {
        Job { name, priority }
    }

    #[test]
    fn test_pop_order() {
        let mut q = queue();
        for (name, priority) in [("a", 1), ("b", 5), ("c", 3), ("d", 4), ("e", 2)] {
            q.push(job(name, priority));
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|j| j.name).collect();
        assert_eq!(order, vec!["b", "d", "c", "e", "a"]);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_remove_keeps_heap_valid() {
        let mut q = queue();
        for (name, priority) in [("a", 1), ("b", 5), ("c", 3), ("d", 4), ("e", 2)] {
            q.push(job(name, priority));
        }
        assert_eq!(q.remove(&job("d", 0)).map(|j| j.name), Some("d"));
        assert!(q.remove(&job("zz", 0)).is_none());
        assert!(!q.contains(&job("d", 0)));
        assert!(q.contains(&job("a", 0)));
        assert_eq!(q.len(), 4);

        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|j| j.name).collect();
        assert_eq!(order, vec!["b", "c", "e", "a"]);
    }

    #[test]
    fn test_reorder_after_key_change() {
        let mut q = queue();
        q.push(job("a", 1));
        q.push(job("b", 2));
        q.push(job("c", 3));
        assert_eq!(q.peek().map(|j| j.name), Some("c"));

        // Mutate keys behind the heap's back, as builds do.
        for item in q.items.iter_mut() {
            if item.name == "a" {
                item.priority = 10;
            }
        }
        q.reorder();
        assert_eq!(q.peek().map(|j| j.name), Some("a"));
        let sorted: Vec<_> = q.sorted().into_iter().map(|j| j.name).collect();
        assert_eq!(sorted, vec!["a", "c", "b"]);
    }
}
