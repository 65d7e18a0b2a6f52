//! Open-addressed hash table with tombstones.
//!
//! Capacity is always a power of two; probing is linear; deletion leaves a
//! tombstone so probe chains stay intact. The load factor is kept below
//! 0.70 by a free-slot counter: when it reaches zero the table rehashes
//! into the next power of two, dropping tombstones on the way.
//!
//! Keys are tagged values paired with their precomputed hash. Hashes are
//! computed by the caller ([`crate::value::Value::hash`]) because string
//! hashes live in the heap and the table itself must stay heap-free; the
//! stored copy also lets rehashing run without recomputing anything.

use crate::value::Value;

const MIN_CAPACITY: usize = 8;
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Used { key: Value, khash: u32, val: Value },
}

#[derive(Debug, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Live entries.
    count: usize,
    /// Insertions into truly empty slots left before a rehash is due.
    left: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn with_capacity(hint: usize) -> Self {
        let mut t = Table::default();
        if hint > 0 {
            t.rehash(hint.next_power_of_two().max(MIN_CAPACITY));
        }
        t
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.slots.len() * std::mem::size_of::<Slot>()
    }

    /// Main position plus linear probe. Returns the index of the matching
    /// slot, or of the slot an insertion should use (remembered tombstone
    /// or first empty).
    fn probe(&self, key: Value, khash: u32) -> (usize, bool) {
        debug_assert!(!self.slots.is_empty());
        let mask = self.slots.len() - 1;
        let mut idx = khash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.slots[idx] {
                Slot::Empty => return (tombstone.unwrap_or(idx), false),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Slot::Used { key: k, khash: h, .. } => {
                    if h == khash && Value::raw_eq(k, key) {
                        return (idx, true);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, key: Value, khash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key, khash) {
            (idx, true) => match self.slots[idx] {
                Slot::Used { val, .. } => Some(val),
                _ => unreachable!(),
            },
            (_, false) => None,
        }
    }

    /// Insert or update. Returns true when the key is new.
    pub fn set(&mut self, key: Value, khash: u32, val: Value) -> bool {
        if self.left == 0 {
            let grown = (self.slots.len() * 2).max(MIN_CAPACITY);
            self.rehash(grown);
        }
        let (idx, found) = self.probe(key, khash);
        if found {
            self.slots[idx] = Slot::Used { key, khash, val };
            return false;
        }
        if matches!(self.slots[idx], Slot::Empty) {
            self.left -= 1;
        }
        self.slots[idx] = Slot::Used { key, khash, val };
        self.count += 1;
        true
    }

    pub fn remove(&mut self, key: Value, khash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key, khash) {
            (idx, true) => {
                let old = match self.slots[idx] {
                    Slot::Used { val, .. } => val,
                    _ => unreachable!(),
                };
                self.slots[idx] = Slot::Tombstone;
                self.count -= 1;
                Some(old)
            }
            (_, false) => None,
        }
    }

    fn rehash(&mut self, new_cap: usize) {
        debug_assert!(new_cap.is_power_of_two());
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        self.count = 0;
        self.left = new_cap * LOAD_NUM / LOAD_DEN;
        for slot in old {
            if let Slot::Used { key, khash, val } = slot {
                let (idx, _) = self.probe(key, khash);
                self.slots[idx] = Slot::Used { key, khash, val };
                self.count += 1;
                self.left -= 1;
            }
        }
    }

    /// Slot index of a live entry, for resuming iteration after a known
    /// key.
    pub fn slot_of(&self, key: Value, khash: u32) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key, khash) {
            (idx, true) => Some(idx),
            (_, false) => None,
        }
    }

    /// First used slot at or after `from`, for stateless iteration: the
    /// returned index + 1 is the next cursor. Entry order is unspecified
    /// but stable while the table is not mutated.
    pub fn next_entry(&self, from: usize) -> Option<(usize, Value, Value)> {
        for idx in from..self.slots.len() {
            if let Slot::Used { key, val, .. } = self.slots[idx] {
                return Some((idx, key, val));
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Used { key, val, .. } => Some((*key, *val)),
            _ => None,
        })
    }

    /// Values of every live entry; the collector traverses these.
    pub fn entries_for_trace(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cript_core::hash::hash_int;

    fn ikey(i: i64) -> (Value, u32) {
        (Value::Int(i), hash_int(i))
    }

    #[test]
    fn insert_update_lookup() {
        let mut t = Table::new();
        let (k, h) = ikey(42);
        assert!(t.set(k, h, Value::Int(1)));
        assert!(!t.set(k, h, Value::Int(2)));
        assert!(matches!(t.get(k, h), Some(Value::Int(2))));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..1000 {
            let (k, h) = ikey(i);
            t.set(k, h, Value::Int(i * 2));
        }
        assert_eq!(t.len(), 1000);
        for i in 0..1000 {
            let (k, h) = ikey(i);
            assert!(matches!(t.get(k, h), Some(Value::Int(v)) if v == i * 2));
        }
        assert!(t.slots.len().is_power_of_two());
        // below the 0.70 load bound
        assert!(t.len() * LOAD_DEN <= t.slots.len() * LOAD_NUM);
    }

    #[test]
    fn tombstones_keep_probe_chains_alive() {
        let mut t = Table::new();
        for i in 0..64 {
            let (k, h) = ikey(i);
            t.set(k, h, Value::Int(i));
        }
        for i in (0..64).step_by(2) {
            let (k, h) = ikey(i);
            assert!(t.remove(k, h).is_some());
        }
        for i in (1..64).step_by(2) {
            let (k, h) = ikey(i);
            assert!(t.get(k, h).is_some(), "lost key {i} after deletions");
        }
        assert_eq!(t.len(), 32);
    }

    #[test]
    fn iteration_sees_each_entry_once() {
        let mut t = Table::new();
        for i in 0..20 {
            let (k, h) = ikey(i);
            t.set(k, h, Value::Int(-i));
        }
        let mut seen = vec![false; 20];
        let mut cursor = 0;
        while let Some((idx, k, _)) = t.next_entry(cursor) {
            cursor = idx + 1;
            if let Value::Int(i) = k {
                assert!(!seen[i as usize]);
                seen[i as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
