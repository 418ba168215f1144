//! Index-tracking binary min-heap of record uids.
//!
//! Order: lower confidence first; for equal confidence the larger (newer) uid
//! is "smaller", so the newest of a tie sits closest to the root. `positions`
//! maps every uid to its slot for O(log N) removal by uid.

use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct HeapSlot {
    pub uid: u64,
    pub confidence: f32,
}

fn ranks_below(a: &HeapSlot, b: &HeapSlot) -> bool {
    match a.confidence.total_cmp(&b.confidence) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a.uid > b.uid,
    }
}

#[derive(Debug, Default)]
pub(crate) struct UidMinHeap {
    slots: Vec<HeapSlot>,
    positions: HashMap<u64, usize>,
}

impl UidMinHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, uid: u64) -> bool {
        self.positions.contains_key(&uid)
    }

    pub fn peek(&self) -> Option<HeapSlot> {
        self.slots.first().copied()
    }

    /// Insert a uid. A uid already present keeps its old slot.
    pub fn push(&mut self, uid: u64, confidence: f32) {
        if self.contains(uid) {
            return;
        }
        let idx = self.slots.len();
        self.slots.push(HeapSlot { uid, confidence });
        self.positions.insert(uid, idx);
        self.sift_up(idx);
    }

    pub fn pop(&mut self) -> Option<HeapSlot> {
        let root = self.peek()?;
        self.remove(root.uid)
    }

    pub fn remove(&mut self, uid: u64) -> Option<HeapSlot> {
        let idx = *self.positions.get(&uid)?;
        let last = self.slots.len() - 1;
        self.swap(idx, last);
        let removed = self.slots.pop()?;
        self.positions.remove(&uid);
        if idx < self.slots.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
        Some(removed)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.slots.swap(a, b);
        self.positions.insert(self.slots[a].uid, a);
        self.positions.insert(self.slots[b].uid, b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !ranks_below(&self.slots[idx], &self.slots[parent]) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && ranks_below(&self.slots[left], &self.slots[smallest]) {
                smallest = left;
            }
            if right < len && ranks_below(&self.slots[right], &self.slots[smallest]) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (i, slot) in self.slots.iter().enumerate() {
            assert_eq!(self.positions.get(&slot.uid), Some(&i));
            if i > 0 {
                let parent = &self.slots[(i - 1) / 2];
                assert!(!ranks_below(slot, parent), "heap order broken at {}", i);
            }
        }
        assert_eq!(self.positions.len(), self.slots.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn equal_confidence_newest_is_root() {
        let mut heap = UidMinHeap::default();
        heap.push(1, 0.5);
        heap.push(2, 0.5);
        heap.push(3, 0.7);
        assert_eq!(heap.peek().map(|s| s.uid), Some(2));
    }

    #[test]
    fn remove_by_uid_keeps_heap_valid() {
        let mut heap = UidMinHeap::default();
        for (uid, c) in [(1, 0.9), (2, 0.1), (3, 0.5), (4, 0.3), (5, 0.7)] {
            heap.push(uid, c);
        }
        assert_eq!(heap.remove(3).map(|s| s.confidence), Some(0.5));
        assert!(heap.remove(3).is_none());
        heap.check_invariants();
        assert_eq!(heap.pop().map(|s| s.uid), Some(2));
        assert_eq!(heap.pop().map(|s| s.uid), Some(4));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn random_operations_match_sorted_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut heap = UidMinHeap::with_capacity(64);
        let mut reference: Vec<HeapSlot> = Vec::new();
        for uid in 1..=500u64 {
            match rng.gen_range(0..3) {
                0 if !reference.is_empty() => {
                    let victim = reference[rng.gen_range(0..reference.len())].uid;
                    reference.retain(|s| s.uid != victim);
                    assert!(heap.remove(victim).is_some());
                }
                _ => {
                    let confidence = rng.gen_range(0..10) as f32 / 10.0;
                    heap.push(uid, confidence);
                    reference.push(HeapSlot { uid, confidence });
                }
            }
            heap.check_invariants();
            let expected = reference
                .iter()
                .copied()
                .reduce(|a, b| if ranks_below(&b, &a) { b } else { a });
            assert_eq!(heap.peek(), expected);
        }
    }
}
