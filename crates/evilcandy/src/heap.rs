//! Reference-counted arena backing all aggregate runtime values.
//!
//! Slots hold a refcount and a payload; `dec_ref` to zero runs the
//! payload's destructor exactly once (child references are released
//! recursively, so destruction-within-destruction is LIFO) and recycles
//! the slot through a free list. Cycles are not collected — the
//! interpreter's construction rules keep the object graph acyclic.

use std::cell::Cell as StdCell;

use crate::{
    types::{Cell, Complex, Dict, EcBytes, EcStr, File, Floats, Function, List, Method, Range, Tuple, Type},
    value::Value,
};

/// Index of a live arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    #[inline]
    fn index(self) -> usize {
        self.0
    }
}

/// Payload of one heap slot.
#[derive(Debug)]
pub enum HeapData {
    Str(EcStr),
    Bytes(EcBytes),
    List(List),
    Tuple(Tuple),
    Dict(Dict),
    Floats(Floats),
    Range(Range),
    Complex(Complex),
    Func(Function),
    Method(Method),
    Cell(Cell),
    File(File),
}

impl HeapData {
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Str(_) => Type::String,
            Self::Bytes(_) => Type::Bytes,
            Self::List(_) => Type::List,
            Self::Tuple(_) => Type::Tuple,
            Self::Dict(_) => Type::Dict,
            Self::Floats(_) => Type::Floats,
            Self::Range(_) => Type::Range,
            Self::Complex(_) => Type::Complex,
            Self::Func(_) => Type::Function,
            Self::Method(_) => Type::Method,
            Self::Cell(_) => Type::Function,
            Self::File(_) => Type::File,
        }
    }

    /// Drains every child value this payload owns, so the heap can release
    /// their references after the payload itself is gone.
    fn take_children(&mut self, out: &mut Vec<Value>) {
        match self {
            Self::List(l) => out.append(&mut l.take_items()),
            Self::Tuple(t) => out.append(&mut t.take_items()),
            Self::Dict(d) => out.append(&mut d.take_values()),
            Self::Func(f) => {
                let (defaults, cells) = f.take_captures();
                out.extend(defaults);
                out.extend(cells.into_iter().map(Value::Ref));
            }
            Self::Method(m) => out.push(std::mem::replace(&mut m.owner, Value::Null)),
            Self::Cell(c) => out.push(std::mem::replace(&mut c.0, Value::Null)),
            Self::Str(_) | Self::Bytes(_) | Self::Floats(_) | Self::Range(_) | Self::Complex(_) | Self::File(_) => {}
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    refcount: StdCell<usize>,
    data: HeapData,
}

/// The arena. One per interpreter; never shared across threads.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// Freed slot ids, reused by later allocations.
    free_list: Vec<HeapId>,
    /// Total number of destructor runs, for leak assertions in tests.
    freed_count: usize,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot with refcount 1 and returns its id.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let entry = HeapEntry {
            refcount: StdCell::new(1),
            data,
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Bumps the refcount. Interior mutability keeps this `&self` so
    /// values can be cloned while the heap is only shared-borrowed.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Drops one reference; frees the slot and releases children when the
    /// count reaches zero.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let mut data = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.get();
            if count > 1 {
                entry.refcount.set(count - 1);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed").data
        };
        self.free_list.push(id);
        self.freed_count += 1;

        let mut children = Vec::new();
        data.take_children(&mut children);
        drop(data);
        for child in children {
            child.drop_with_heap(self);
        }
    }

    /// # Panics
    /// Panics if the slot is missing or already freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Current refcount of a live slot, or 0 when freed. For invariants
    /// checks and tests.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |e| e.refcount.get())
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Total destructor runs since creation.
    #[must_use]
    pub fn freed_count(&self) -> usize {
        self.freed_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_lifecycle() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::List(List::new()));
        assert_eq!(heap.refcount(id), 1);
        heap.inc_ref(id);
        assert_eq!(heap.refcount(id), 2);
        heap.dec_ref(id);
        assert_eq!(heap.refcount(id), 1);
        heap.dec_ref(id);
        assert_eq!(heap.refcount(id), 0);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.freed_count(), 1);
    }

    #[test]
    fn slot_reuse_through_free_list() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::List(List::new()));
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Tuple(Tuple::default()));
        assert_eq!(a, b);
        assert_eq!(heap.live_count(), 1);
        heap.dec_ref(b);
    }

    #[test]
    fn children_released_recursively() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::List(List::new()));
        let outer = heap.allocate(HeapData::List(List::from_items(vec![Value::Ref(inner)])));
        assert_eq!(heap.live_count(), 2);
        heap.dec_ref(outer);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.freed_count(), 2);
    }

    #[test]
    fn shared_child_survives_one_parent() {
        let mut heap = Heap::new();
        let child = heap.allocate(HeapData::List(List::new()));
        heap.inc_ref(child);
        let parent = heap.allocate(HeapData::List(List::from_items(vec![Value::Ref(child)])));
        heap.dec_ref(parent);
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(child);
        assert_eq!(heap.live_count(), 0);
    }
}
