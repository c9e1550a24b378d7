//! Host-facing value snapshots.
//!
//! Interpreter values are arena references that only mean something next to
//! their heap; [`Object`] is the detached deep copy handed to embedders and
//! tests. Conversion is one-way — the interpreter never reads objects back.

use crate::{
    heap::{Heap, HeapData},
    intern::Interns,
    value::Value,
};

/// A detached snapshot of a runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    /// Key/value pairs, sorted by key for stable comparisons.
    Dict(Vec<(String, Object)>),
    Floats(Vec<f64>),
    Complex { re: f64, im: f64 },
    Range { start: i64, stop: i64, step: i64 },
    Function,
    Method,
    File,
}

impl Object {
    pub(crate) fn from_value(v: &Value, heap: &Heap, interns: &Interns) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(*f),
            Value::Str(id) => Self::Str(interns.get_str(*id).to_owned()),
            Value::Bytes(id) => Self::Bytes(interns.get_bytes(*id).to_vec()),
            Value::Builtin(_) => Self::Function,
            Value::Slot(_) => Self::Null,
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::Str(s.as_str().to_owned()),
                HeapData::Bytes(b) => Self::Bytes(b.as_slice().to_vec()),
                HeapData::List(l) => Self::List(
                    l.items()
                        .iter()
                        .map(|x| Self::from_value(x, heap, interns))
                        .collect(),
                ),
                HeapData::Tuple(t) => Self::Tuple(
                    t.items()
                        .iter()
                        .map(|x| Self::from_value(x, heap, interns))
                        .collect(),
                ),
                HeapData::Dict(d) => {
                    let mut pairs: Vec<(String, Self)> = d
                        .entries()
                        .map(|e| (e.key().to_owned(), Self::from_value(&e.value, heap, interns)))
                        .collect();
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    Self::Dict(pairs)
                }
                HeapData::Floats(f) => {
                    Self::Floats((0..f.len()).map(|i| f.get(i as i64).unwrap_or(f64::NAN)).collect())
                }
                HeapData::Range(r) => Self::Range {
                    start: r.start,
                    stop: r.stop,
                    step: r.step,
                },
                HeapData::Complex(c) => Self::Complex { re: c.re, im: c.im },
                HeapData::Func(_) | HeapData::Cell(_) => Self::Function,
                HeapData::Method(_) => Self::Method,
                HeapData::File(_) => Self::File,
            },
        }
    }
}
