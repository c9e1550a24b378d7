//! Mutable list payload with an in-use iteration lock.

use crate::{
    exc::{RunError, RunResult},
    value::Value,
};

/// A growable array of values.
///
/// The lock flag is set by in-process iterators (`foreach`) and forbids any
/// mutation while held, so callbacks cannot invalidate the iteration.
#[derive(Debug, Default)]
pub struct List {
    items: Vec<Value>,
    locked: bool,
}

impl List {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_items(items: Vec<Value>) -> Self {
        Self { items, locked: false }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: i64) -> Option<&Value> {
        let idx = self.resolve_index(index)?;
        self.items.get(idx)
    }

    /// Replaces the element at `index`, returning the old value for the
    /// caller to release. An out-of-range index hands the value back in
    /// `Err`. Callers verify the lock first (`check_unlocked`), so a
    /// rejected value never changes ownership.
    pub fn set(&mut self, index: i64, value: Value) -> Result<Value, Value> {
        let Some(idx) = self.resolve_index(index) else {
            return Err(value);
        };
        Ok(std::mem::replace(&mut self.items[idx], value))
    }

    /// Appends an element. Callers verify the lock first.
    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> RunResult<Option<Value>> {
        self.check_unlocked()?;
        Ok(self.items.pop())
    }

    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Drains all elements; used by the destructor to release child refs.
    pub fn take_items(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.items)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Takes the iteration lock. Nested foreach over the same list is
    /// rejected rather than silently permitted.
    pub fn lock(&mut self) -> RunResult<()> {
        if self.locked {
            return Err(RunError::runtime("list is locked by an active iteration"));
        }
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Fails with `RuntimeError` while an iteration holds the lock.
    pub fn check_unlocked(&self) -> RunResult<()> {
        if self.locked {
            return Err(RunError::runtime("cannot modify a locked list during iteration"));
        }
        Ok(())
    }

    fn resolve_index(&self, index: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let idx = if index < 0 { index + len } else { index };
        if idx < 0 || idx >= len {
            return None;
        }
        Some(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_list_rejects_mutation() {
        let mut list = List::from_items(vec![Value::Int(1)]);
        list.lock().unwrap();
        assert!(list.check_unlocked().is_err());
        assert!(list.pop().is_err());
        list.unlock();
        list.check_unlocked().unwrap();
        list.push(Value::Int(2));
        assert_eq!(list.len(), 2);
        assert!(matches!(list.set(5, Value::Int(9)), Err(Value::Int(9))));
        assert!(matches!(list.set(0, Value::Int(9)), Ok(Value::Int(1))));
    }

    #[test]
    fn negative_indexing() {
        let list = List::from_items(vec![Value::Int(10), Value::Int(20)]);
        assert!(matches!(list.get(-1), Some(Value::Int(20))));
        assert!(list.get(2).is_none());
        assert!(list.get(-3).is_none());
    }
}
