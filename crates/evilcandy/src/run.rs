//! Interpreter state and the embedding API.
//!
//! All process-wide state of the original design — the globals table, the
//! interned-strings table, the heap, the frame free list, the reentry
//! depth — lives in one [`Interp`] value, so independent interpreter
//! instances can coexist.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    builtins::BuiltinFn,
    exc::RunResult,
    heap::{Heap, HeapData},
    intern::{Interns, StringId},
    io::{PrintWriter, StdPrint},
    object::Object,
    types::Dict,
    value::Value,
    vm::Vm,
    xptr::Xptr,
};

/// One global binding.
#[derive(Debug)]
pub(crate) struct GlobalEntry {
    pub value: Value,
    pub constant: bool,
}

/// The global symbol table: `let` declarations at the top level plus the
/// pre-bound builtins.
#[derive(Debug, Default)]
pub(crate) struct Globals {
    map: AHashMap<StringId, GlobalEntry>,
}

impl Globals {
    /// Adds a binding holding null. Re-declaring keeps the current value.
    pub fn declare(&mut self, name: StringId) {
        self.map.entry(name).or_insert(GlobalEntry {
            value: Value::Null,
            constant: false,
        });
    }

    pub fn get(&self, name: StringId) -> Option<&GlobalEntry> {
        self.map.get(&name)
    }

    pub fn contains(&self, name: StringId) -> bool {
        self.map.contains_key(&name)
    }

    /// Stores into an existing binding, honoring and setting const locks.
    pub fn set(
        &mut self,
        name: StringId,
        value: Value,
        make_const: bool,
        heap: &mut Heap,
        interns: &Interns,
    ) -> RunResult<()> {
        let Some(entry) = self.map.get_mut(&name) else {
            value.drop_with_heap(heap);
            return Err(crate::exc::RunError::runtime(format!(
                "symbol '{}' not found",
                interns.get_str(name)
            )));
        };
        if entry.constant {
            value.drop_with_heap(heap);
            return Err(crate::exc::RunError::runtime(format!(
                "cannot assign to const '{}'",
                interns.get_str(name)
            )));
        }
        let old = std::mem::replace(&mut entry.value, value);
        entry.constant = make_const;
        old.drop_with_heap(heap);
        Ok(())
    }

    fn insert_builtin(&mut self, name: StringId, f: BuiltinFn) {
        self.map.insert(
            name,
            GlobalEntry {
                value: Value::Builtin(f),
                constant: false,
            },
        );
    }
}

/// A complete interpreter instance.
pub struct Interp {
    pub(crate) heap: Heap,
    pub(crate) interns: Interns,
    pub(crate) globals: Globals,
    /// The globals object: `this` at the top level, reachable as `global`.
    pub(crate) gbl: crate::heap::HeapId,
    pub(crate) writer: Box<dyn PrintWriter>,
    /// Recycled frame stack buffers.
    stack_bufs: Vec<Vec<Value>>,
    pub(crate) reent_depth: usize,
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(Box::new(StdPrint))
    }

    /// Builds an interpreter that prints through `writer`.
    #[must_use]
    pub fn with_writer(writer: Box<dyn PrintWriter>) -> Self {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let gbl = heap.allocate(HeapData::Dict(Dict::new()));
        let mut globals = Globals::default();
        for f in BuiltinFn::ALL {
            let name = interns.intern(f.name());
            globals.insert_builtin(name, f);
        }
        Self {
            heap,
            interns,
            globals,
            gbl,
            writer,
            stack_bufs: Vec::new(),
            reent_depth: 0,
        }
    }

    /// Compiles one source file to its entry-point executable.
    pub fn compile(&mut self, src: &str, file_name: &str) -> RunResult<Rc<Xptr>> {
        crate::assemble::assemble(src, file_name, &mut self.interns, &mut self.heap)
    }

    /// Executes a compiled script.
    pub fn execute(&mut self, xptr: &Rc<Xptr>) -> RunResult<()> {
        Vm::new(self).exec_script(xptr)
    }

    /// Compiles and runs in one step.
    pub fn run_source(&mut self, src: &str, file_name: &str) -> RunResult<()> {
        let xptr = self.compile(src, file_name)?;
        self.execute(&xptr)
    }

    /// Reads a global binding as a host-facing snapshot. Used by embedders
    /// and tests to observe script results.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Object> {
        let id = self.interns.lookup(name)?;
        let entry = self.globals.get(id)?;
        Some(Object::from_value(&entry.value, &self.heap, &self.interns))
    }

    /// Live heap object count; exposed for leak assertions in tests.
    #[must_use]
    pub fn heap_live(&self) -> usize {
        self.heap.live_count()
    }

    /// Serializes a compiled tree to the byte-code file format.
    #[must_use]
    pub fn serialize(&self, xptr: &Rc<Xptr>) -> Vec<u8> {
        crate::serialize::serialize_xptr(xptr, &self.interns)
    }

    /// Reads a byte-code file back into an executable tree.
    pub fn deserialize(&mut self, data: &[u8]) -> RunResult<Rc<Xptr>> {
        crate::serialize::deserialize_xptr(data, &mut self.interns)
    }

    /// Reads a text disassembly listing into an executable tree.
    pub fn reassemble(&mut self, text: &str) -> RunResult<Rc<Xptr>> {
        crate::reassemble::reassemble(text, &mut self.interns)
    }

    /// The intern tables, read-only. The disassembly printer needs them to
    /// render string constants.
    #[must_use]
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    pub(crate) fn take_stack_buf(&mut self) -> Vec<Value> {
        self.stack_bufs
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(crate::vm::FRAME_STACK_MAX))
    }

    pub(crate) fn return_stack_buf(&mut self, buf: Vec<Value>) {
        debug_assert!(buf.is_empty(), "returned frame stack still holds values");
        if self.stack_bufs.len() < 32 {
            self.stack_bufs.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_bound() {
        let interp = Interp::new();
        assert!(matches!(interp.global("print"), Some(Object::Function)));
        assert!(interp.global("no_such_global").is_none());
    }

    #[test]
    fn stack_buffers_recycle() {
        let mut interp = Interp::new();
        let buf = interp.take_stack_buf();
        interp.return_stack_buf(buf);
        assert_eq!(interp.stack_bufs.len(), 1);
    }
}
