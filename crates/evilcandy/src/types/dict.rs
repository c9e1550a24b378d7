//! Open-addressed dictionary with string keys.
//!
//! Buckets hold (hash, key, value) plus per-entry const/private flags from
//! object literals. Deleted slots become tombstones: they keep collision
//! chains intact, count toward the fill factor, but not toward `len()`.
//! Capacity is always a power of two and the table grows before fill
//! exceeds two thirds.

use crate::{
    exc::{RunError, RunResult},
    types::str::str_hash,
    value::Value,
};

const MIN_CAPACITY: usize = 8;

/// One live dict entry.
#[derive(Debug)]
pub struct Entry {
    hash: u64,
    key: Box<str>,
    pub value: Value,
    /// Writes after creation raise `RuntimeError`.
    pub constant: bool,
    /// Visible only through `this`.
    pub private: bool,
}

impl Entry {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Default)]
enum Bucket {
    #[default]
    Empty,
    /// A deleted entry; probe chains pass through it.
    Tombstone,
    Full(Entry),
}

/// String-keyed hash table.
#[derive(Debug)]
pub struct Dict {
    buckets: Box<[Bucket]>,
    /// Live entries.
    used: usize,
    /// Live entries plus tombstones; what the load factor is measured on.
    fill: usize,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::iter::repeat_with(Bucket::default).take(MIN_CAPACITY).collect(),
            used: 0,
            fill: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Entry> {
        let idx = self.probe(key, str_hash(key))?;
        match &self.buckets[idx] {
            Bucket::Full(entry) => Some(entry),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let idx = self.probe(key, str_hash(key))?;
        match &mut self.buckets[idx] {
            Bucket::Full(entry) => Some(entry),
            _ => None,
        }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Checks that a store to `key` is permitted. Callers run this before
    /// [`Dict::insert`] so a rejected value never changes ownership.
    pub fn check_store(&self, key: &str) -> RunResult<()> {
        if self.get(key).is_some_and(|e| e.constant) {
            return Err(RunError::runtime(format!("attribute '{key}' is const")));
        }
        Ok(())
    }

    /// Inserts or replaces unconditionally, returning the displaced value
    /// so the caller can release its reference. Store permission is the
    /// caller's job (see [`Dict::check_store`]).
    pub fn insert(&mut self, key: &str, value: Value, constant: bool, private: bool) -> Option<Value> {
        self.grow_if_needed();
        let hash = str_hash(key);
        match self.find_slot(key, hash) {
            Slot::Existing(idx) => {
                let Bucket::Full(entry) = &mut self.buckets[idx] else {
                    unreachable!("Existing slot must be full");
                };
                entry.constant |= constant;
                entry.private |= private;
                Some(std::mem::replace(&mut entry.value, value))
            }
            Slot::Insert { idx, was_tombstone } => {
                self.buckets[idx] = Bucket::Full(Entry {
                    hash,
                    key: Box::from(key),
                    value,
                    constant,
                    private,
                });
                self.used += 1;
                if !was_tombstone {
                    self.fill += 1;
                }
                None
            }
        }
    }

    /// Removes a key, leaving a tombstone, and returns its value for the
    /// caller to release.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.probe(key, str_hash(key))?;
        if !matches!(self.buckets[idx], Bucket::Full(_)) {
            return None;
        }
        let Bucket::Full(entry) = std::mem::replace(&mut self.buckets[idx], Bucket::Tombstone) else {
            unreachable!("checked full above");
        };
        self.used -= 1;
        Some(entry.value)
    }

    /// Copies out all live keys, in bucket order.
    ///
    /// `foreach` iterates this snapshot, so mutation during iteration is
    /// permitted; inserts made by the callback simply aren't visited.
    #[must_use]
    pub fn keys_snapshot(&self) -> Vec<Box<str>> {
        self.buckets
            .iter()
            .filter_map(|b| match b {
                Bucket::Full(entry) if !entry.private => Some(entry.key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Iterates live entries, private included.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.buckets.iter().filter_map(|b| match b {
            Bucket::Full(entry) => Some(entry),
            _ => None,
        })
    }

    /// Drains every value for destructor child-release.
    pub fn take_values(&mut self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.used);
        for bucket in &mut self.buckets {
            if let Bucket::Full(entry) = std::mem::replace(bucket, Bucket::Empty) {
                out.push(entry.value);
            }
        }
        self.used = 0;
        self.fill = 0;
        out
    }

    /// Finds the bucket index holding `key`, following the probe sequence
    /// through tombstones until an empty bucket proves absence.
    fn probe(&self, key: &str, hash: u64) -> Option<usize> {
        let mask = self.buckets.len() as u64 - 1;
        let mut idx = hash & mask;
        let mut perturb = hash;
        loop {
            match &self.buckets[idx as usize] {
                Bucket::Empty => return None,
                Bucket::Tombstone => {}
                Bucket::Full(entry) => {
                    if entry.hash == hash && &*entry.key == key {
                        return Some(idx as usize);
                    }
                }
            }
            perturb >>= 5;
            idx = (idx.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
        }
    }

    /// Finds the slot for an insert: either the existing entry or the first
    /// reusable position (preferring the earliest tombstone on the chain).
    fn find_slot(&self, key: &str, hash: u64) -> Slot {
        let mask = self.buckets.len() as u64 - 1;
        let mut idx = hash & mask;
        let mut perturb = hash;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.buckets[idx as usize] {
                Bucket::Empty => {
                    return match first_tombstone {
                        Some(t) => Slot::Insert {
                            idx: t,
                            was_tombstone: true,
                        },
                        None => Slot::Insert {
                            idx: idx as usize,
                            was_tombstone: false,
                        },
                    };
                }
                Bucket::Tombstone => {
                    first_tombstone.get_or_insert(idx as usize);
                }
                Bucket::Full(entry) => {
                    if entry.hash == hash && &*entry.key == key {
                        return Slot::Existing(idx as usize);
                    }
                }
            }
            perturb >>= 5;
            idx = (idx.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
        }
    }

    fn grow_if_needed(&mut self) {
        if (self.fill + 1) * 3 <= self.buckets.len() * 2 {
            return;
        }
        // Size for live entries only; rehashing discards tombstones.
        let mut capacity = MIN_CAPACITY;
        while (self.used + 1) * 3 > capacity * 2 {
            capacity *= 2;
        }
        let old = std::mem::replace(
            &mut self.buckets,
            std::iter::repeat_with(Bucket::default).take(capacity).collect(),
        );
        self.used = 0;
        self.fill = 0;
        for bucket in old {
            if let Bucket::Full(entry) = bucket {
                let Slot::Insert { idx, .. } = self.find_slot(&entry.key, entry.hash) else {
                    unreachable!("duplicate key during rehash");
                };
                self.buckets[idx] = Bucket::Full(entry);
                self.used += 1;
                self.fill += 1;
            }
        }
    }
}

#[derive(Debug)]
enum Slot {
    Existing(usize),
    Insert { idx: usize, was_tombstone: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_replace() {
        let mut d = Dict::new();
        assert!(d.insert("a", Value::Int(1), false, false).is_none());
        assert!(matches!(d.get("a"), Some(e) if matches!(e.value, Value::Int(1))));
        let old = d.insert("a", Value::Int(2), false, false);
        assert!(matches!(old, Some(Value::Int(1))));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn const_entry_rejects_overwrite() {
        let mut d = Dict::new();
        d.insert("pi", Value::Int(3), true, false);
        assert!(d.check_store("pi").is_err());
        assert!(d.check_store("tau").is_ok());
    }

    #[test]
    fn remove_leaves_chain_intact() {
        let mut d = Dict::new();
        for i in 0..32 {
            d.insert(&format!("k{i}"), Value::Int(i), false, false);
        }
        assert_eq!(d.len(), 32);
        for i in 0..16 {
            assert!(matches!(d.remove(&format!("k{i}")), Some(Value::Int(_))));
        }
        assert_eq!(d.len(), 16);
        // Survivors still reachable despite tombstones on their chains.
        for i in 16..32 {
            assert!(d.has(&format!("k{i}")), "lost k{i}");
        }
        assert!(!d.has("k3"));
    }

    #[test]
    fn capacity_stays_power_of_two_and_load_bounded() {
        let mut d = Dict::new();
        for i in 0..1000 {
            d.insert(&format!("key-{i}"), Value::Int(i), false, false);
        }
        assert_eq!(d.len(), 1000);
        let cap = d.buckets.len();
        assert!(cap.is_power_of_two());
        assert!(d.fill * 3 <= cap * 2 + 2, "fill {} cap {cap}", d.fill);
        for i in (0..1000).step_by(7) {
            assert!(matches!(d.get(&format!("key-{i}")), Some(e) if matches!(e.value, Value::Int(v) if v == i)));
        }
    }

    #[test]
    fn private_keys_hidden_from_snapshot() {
        let mut d = Dict::new();
        d.insert("visible", Value::Int(1), false, false);
        d.insert("hidden", Value::Int(2), false, true);
        let keys = d.keys_snapshot();
        assert_eq!(keys.len(), 1);
        assert_eq!(&*keys[0], "visible");
    }
}
