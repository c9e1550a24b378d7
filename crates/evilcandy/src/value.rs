//! The runtime value representation.
//!
//! Hybrid layout: small immediate values (null, int, float, interned
//! string/bytes, builtin handles) are stored inline and copied freely;
//! aggregates live in the refcounted arena and are carried as
//! `Value::Ref(HeapId)`.
//!
//! NOTE: `Clone` is intentionally not derived. Use `clone_with_heap()` so
//! heap references bump their refcount, and release values through
//! `drop_with_heap()`. A bare copy of a `Ref` would silently unbalance the
//! reference counts.

use crate::{
    builtins::BuiltinFn,
    heap::{Heap, HeapData, HeapId},
    intern::{BytesId, Interns, StringId},
    types::Type,
};

/// A reference to a storage location, pushed by `PUSH_PTR`.
///
/// Slot values are VM-internal: they exist only on frame evaluation stacks
/// and are dereferenced by every consumer (operators, stores, calls).
/// They are never stored into containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    /// Argument slot: frame stack index `arg2` (FP-relative).
    Arg(u16),
    /// Local slot: frame stack index `ap + arg2` (AP-relative).
    Local(u16),
    /// Closure cell index into the frame's cell vector.
    Closure(u16),
    /// Deferred global lookup by name.
    Global(StringId),
    /// The frame's owning object.
    This,
}

/// A runtime value.
#[derive(Debug)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    /// An interned string literal.
    Str(StringId),
    /// An interned bytes literal.
    Bytes(BytesId),
    /// A global builtin function.
    Builtin(BuiltinFn),
    /// A storage reference (see [`SlotRef`]); never escapes the stack.
    Slot(SlotRef),
    /// A heap-allocated value.
    Ref(HeapId),
}

impl Value {
    /// The value's type tag.
    ///
    /// # Panics
    /// Panics on `Slot`: slots must be dereferenced before inspection.
    #[must_use]
    pub fn type_of(&self, heap: &Heap) -> Type {
        match self {
            Self::Null => Type::Null,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Str(_) => Type::String,
            Self::Bytes(_) => Type::Bytes,
            Self::Builtin(_) => Type::Function,
            Self::Slot(_) => panic!("type_of on an undereferenced slot"),
            Self::Ref(id) => heap.get(*id).type_of(),
        }
    }

    /// Copies the value, bumping the refcount for heap references.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Int(v) => Self::Int(*v),
            Self::Float(v) => Self::Float(*v),
            Self::Str(id) => Self::Str(*id),
            Self::Bytes(id) => Self::Bytes(*id),
            Self::Builtin(f) => Self::Builtin(*f),
            Self::Slot(s) => Self::Slot(*s),
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
        }
    }

    /// Releases the value's reference, freeing the heap object when this
    /// was the last one.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// Truthiness (the type protocol's `cmpz`, inverted).
    #[must_use]
    pub fn truthy(&self, heap: &Heap, interns: &Interns) -> bool {
        match self {
            Self::Null => false,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Str(id) => !interns.get_str(*id).is_empty(),
            Self::Bytes(id) => !interns.get_bytes(*id).is_empty(),
            Self::Builtin(_) | Self::Slot(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => s.byte_len() != 0,
                HeapData::Bytes(b) => !b.is_empty(),
                HeapData::List(l) => !l.is_empty(),
                HeapData::Tuple(t) => !t.is_empty(),
                HeapData::Dict(d) => !d.is_empty(),
                HeapData::Floats(f) => !f.is_empty(),
                HeapData::Range(r) => !r.is_empty(),
                HeapData::Complex(c) => c.re != 0.0 || c.im != 0.0,
                HeapData::Func(_) | HeapData::Method(_) | HeapData::Cell(_) | HeapData::File(_) => true,
            },
        }
    }

    /// Borrows the string content when the value is a string of either
    /// representation.
    #[must_use]
    pub fn as_str<'a>(&'a self, heap: &'a Heap, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::Str(id) => Some(interns.get_str(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Borrows bytes content of either representation.
    #[must_use]
    pub fn as_bytes<'a>(&'a self, heap: &'a Heap, interns: &'a Interns) -> Option<&'a [u8]> {
        match self {
            Self::Bytes(id) => Some(interns.get_bytes(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Bytes(b) => Some(b.as_slice()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Element count for sequence and mapping values.
    #[must_use]
    pub fn seq_len(&self, heap: &Heap, interns: &Interns) -> Option<usize> {
        match self {
            Self::Str(id) => Some(interns.get(*id).char_len()),
            Self::Bytes(id) => Some(interns.get_bytes(*id).len()),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.char_len()),
                HeapData::Bytes(b) => Some(b.len()),
                HeapData::List(l) => Some(l.len()),
                HeapData::Tuple(t) => Some(t.len()),
                HeapData::Dict(d) => Some(d.len()),
                HeapData::Floats(f) => Some(f.len()),
                HeapData::Range(r) => Some(r.len()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Renders a value the way `print` and `str()` do.
///
/// Strings render raw at the top level and quoted inside containers.
#[must_use]
pub fn display_value(v: &Value, heap: &Heap, interns: &Interns) -> String {
    let mut out = String::new();
    fmt_value(&mut out, v, heap, interns, false);
    out
}

fn fmt_value(out: &mut String, v: &Value, heap: &Heap, interns: &Interns, quoted: bool) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => {
            let mut buf = ryu::Buffer::new();
            out.push_str(buf.format(*f));
        }
        Value::Str(id) => fmt_str(out, interns.get_str(*id), quoted),
        Value::Bytes(id) => fmt_bytes(out, interns.get_bytes(*id)),
        Value::Builtin(f) => {
            out.push_str("<builtin function ");
            out.push_str(f.name());
            out.push('>');
        }
        Value::Slot(_) => out.push_str("<slot>"),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => fmt_str(out, s.as_str(), quoted),
            HeapData::Bytes(b) => fmt_bytes(out, b.as_slice()),
            HeapData::List(l) => {
                out.push('[');
                for (i, item) in l.items().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    fmt_value(out, item, heap, interns, true);
                }
                out.push(']');
            }
            HeapData::Tuple(t) => {
                out.push('(');
                for (i, item) in t.items().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    fmt_value(out, item, heap, interns, true);
                }
                out.push(')');
            }
            HeapData::Dict(d) => {
                out.push('{');
                for (i, entry) in d.entries().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(entry.key());
                    out.push_str(": ");
                    fmt_value(out, &entry.value, heap, interns, true);
                }
                out.push('}');
            }
            HeapData::Floats(f) => {
                out.push_str("floats[");
                let mut buf = ryu::Buffer::new();
                for i in 0..f.len() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(buf.format(f.get(i as i64).unwrap_or(f64::NAN)));
                }
                out.push(']');
            }
            HeapData::Range(r) => {
                out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
            }
            HeapData::Complex(c) => {
                let mut buf = ryu::Buffer::new();
                out.push('(');
                out.push_str(buf.format(c.re));
                if c.im >= 0.0 {
                    out.push('+');
                }
                out.push_str(buf.format(c.im));
                out.push_str("j)");
            }
            HeapData::Func(f) => {
                out.push_str(&format!("<function {}>", f.xptr().uuid));
            }
            HeapData::Method(m) => {
                out.push_str("<method ");
                out.push_str(m.method.name());
                out.push('>');
            }
            HeapData::Cell(_) => out.push_str("<cell>"),
            HeapData::File(f) => {
                out.push_str(&format!("<file '{}' fd {}>", f.path(), f.fd()));
            }
        },
    }
}

fn fmt_str(out: &mut String, s: &str, quoted: bool) {
    if quoted {
        out.push('"');
        out.push_str(s);
        out.push('"');
    } else {
        out.push_str(s);
    }
}

fn fmt_bytes(out: &mut String, b: &[u8]) {
    out.push_str("b\"");
    for &byte in b {
        if byte.is_ascii_graphic() || byte == b' ' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::List;

    #[test]
    fn display_immediates() {
        let heap = Heap::new();
        let mut interns = Interns::new();
        let s = interns.intern("hi");
        assert_eq!(display_value(&Value::Null, &heap, &interns), "null");
        assert_eq!(display_value(&Value::Int(-3), &heap, &interns), "-3");
        assert_eq!(display_value(&Value::Float(1.5), &heap, &interns), "1.5");
        assert_eq!(display_value(&Value::Str(s), &heap, &interns), "hi");
    }

    #[test]
    fn display_nested_list_quotes_strings() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let s = interns.intern("x");
        let id = heap.allocate(HeapData::List(List::from_items(vec![Value::Int(1), Value::Str(s)])));
        let v = Value::Ref(id);
        assert_eq!(display_value(&v, &heap, &interns), "[1, \"x\"]");
        v.drop_with_heap(&mut heap);
    }

    #[test]
    fn truthiness() {
        let heap = Heap::new();
        let mut interns = Interns::new();
        let empty = interns.intern("");
        let full = interns.intern("a");
        assert!(!Value::Null.truthy(&heap, &interns));
        assert!(!Value::Int(0).truthy(&heap, &interns));
        assert!(Value::Int(2).truthy(&heap, &interns));
        assert!(!Value::Str(empty).truthy(&heap, &interns));
        assert!(Value::Str(full).truthy(&heap, &interns));
    }
}
