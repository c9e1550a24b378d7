//! Function, bound method, and closure-cell payloads.

use std::rc::Rc;

use crate::{heap::HeapId, types::Type, value::Value, xptr::Xptr};

/// A callable user function: an immutable handle on compiled code plus the
/// bindings captured at definition time.
#[derive(Debug)]
pub struct Function {
    xptr: Rc<Xptr>,
    /// Default values, keyed by argument position, captured at definition.
    defaults: Vec<(u16, Value)>,
    /// Closure cells, shared with every frame executing this function.
    closure: Vec<HeapId>,
}

impl Function {
    #[must_use]
    pub fn new(xptr: Rc<Xptr>) -> Self {
        Self {
            xptr,
            defaults: Vec::new(),
            closure: Vec::new(),
        }
    }

    #[must_use]
    pub fn xptr(&self) -> &Rc<Xptr> {
        &self.xptr
    }

    /// Binds the default for argument `index`. Emitted by `ADD_DEFAULT`
    /// right after `DEFFUNC`, so definition order is preserved.
    pub fn add_default(&mut self, index: u16, value: Value) {
        self.defaults.push((index, value));
    }

    #[must_use]
    pub fn default_for(&self, index: u16) -> Option<&Value> {
        self.defaults.iter().find(|(i, _)| *i == index).map(|(_, v)| v)
    }

    #[must_use]
    pub fn defaults(&self) -> &[(u16, Value)] {
        &self.defaults
    }

    pub fn add_closure(&mut self, cell: HeapId) {
        self.closure.push(cell);
    }

    #[must_use]
    pub fn closure(&self) -> &[HeapId] {
        &self.closure
    }

    /// Drains captured values and cells for destructor child-release.
    pub fn take_captures(&mut self) -> (Vec<Value>, Vec<HeapId>) {
        let defaults = std::mem::take(&mut self.defaults).into_iter().map(|(_, v)| v).collect();
        let closure = std::mem::take(&mut self.closure);
        (defaults, closure)
    }
}

/// A closure cell: one captured binding, shared between a function value
/// and the frames that execute it so stores persist across calls.
#[derive(Debug)]
pub struct Cell(pub Value);

/// Built-in methods, dispatched by receiver type and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethod {
    StrLen,
    StrSlice,
    BytesLen,
    ListLen,
    ListAppend,
    ListPop,
    ListForeach,
    ListSort,
    DictLen,
    DictKeys,
    DictHas,
    DictForeach,
    TupleLen,
    FloatsLen,
    FloatsAppend,
    FloatsSum,
    FloatsMean,
    FloatsVar,
    FloatsMin,
    FloatsMax,
    FloatsAny,
    FloatsAll,
    RangeLen,
    FileClose,
}

impl BuiltinMethod {
    /// Resolves an attribute name on a receiver type to a builtin method.
    #[must_use]
    pub fn lookup(ty: Type, name: &str) -> Option<Self> {
        let m = match (ty, name) {
            (Type::String, "len") => Self::StrLen,
            (Type::String, "slice") => Self::StrSlice,
            (Type::Bytes, "len") => Self::BytesLen,
            (Type::List, "len") => Self::ListLen,
            (Type::List, "append") => Self::ListAppend,
            (Type::List, "pop") => Self::ListPop,
            (Type::List, "foreach") => Self::ListForeach,
            (Type::List, "sort") => Self::ListSort,
            (Type::Dict, "len") => Self::DictLen,
            (Type::Dict, "keys") => Self::DictKeys,
            (Type::Dict, "has") => Self::DictHas,
            (Type::Dict, "foreach") => Self::DictForeach,
            (Type::Tuple, "len") => Self::TupleLen,
            (Type::Floats, "len") => Self::FloatsLen,
            (Type::Floats, "append") => Self::FloatsAppend,
            (Type::Floats, "sum") => Self::FloatsSum,
            (Type::Floats, "mean") => Self::FloatsMean,
            (Type::Floats, "var") => Self::FloatsVar,
            (Type::Floats, "min") => Self::FloatsMin,
            (Type::Floats, "max") => Self::FloatsMax,
            (Type::Floats, "any") => Self::FloatsAny,
            (Type::Floats, "all") => Self::FloatsAll,
            (Type::Range, "len") => Self::RangeLen,
            (Type::File, "close") => Self::FileClose,
            _ => return None,
        };
        Some(m)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::StrLen | Self::BytesLen | Self::ListLen | Self::DictLen | Self::TupleLen | Self::FloatsLen
            | Self::RangeLen => "len",
            Self::StrSlice => "slice",
            Self::ListAppend | Self::FloatsAppend => "append",
            Self::ListPop => "pop",
            Self::ListSort => "sort",
            Self::ListForeach | Self::DictForeach => "foreach",
            Self::DictKeys => "keys",
            Self::DictHas => "has",
            Self::FloatsSum => "sum",
            Self::FloatsMean => "mean",
            Self::FloatsVar => "var",
            Self::FloatsMin => "min",
            Self::FloatsMax => "max",
            Self::FloatsAny => "any",
            Self::FloatsAll => "all",
            Self::FileClose => "close",
        }
    }
}

/// A bound (builtin-method, owner) pair produced by attribute lookup.
///
/// Equality is identity of the components, which `PartialEq` on the owner
/// `Value` plus `Copy` method id gives directly.
#[derive(Debug)]
pub struct Method {
    pub owner: Value,
    pub method: BuiltinMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_lookup_by_type() {
        assert_eq!(BuiltinMethod::lookup(Type::String, "len"), Some(BuiltinMethod::StrLen));
        assert_eq!(
            BuiltinMethod::lookup(Type::List, "foreach"),
            Some(BuiltinMethod::ListForeach)
        );
        assert_eq!(BuiltinMethod::lookup(Type::List, "keys"), None);
        assert_eq!(BuiltinMethod::lookup(Type::Int, "len"), None);
    }

    #[test]
    fn method_names() {
        assert_eq!(BuiltinMethod::FloatsMean.name(), "mean");
        assert_eq!(BuiltinMethod::DictForeach.name(), "foreach");
    }
}
