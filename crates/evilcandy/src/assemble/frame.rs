//! Per-function assembly state.
//!
//! One [`AsFrame`] exists for every function currently being compiled.
//! Frames nest because definitions occur inside expressions; the assembler
//! keeps them on an explicit stack (`Vec`) so the closure-capture walk can
//! iterate ancestors instead of reaching into suspended recursion.

use crate::{
    code::{Instr, Opcode},
    exc::{RunError, RunResult},
    intern::StringId,
    xptr::Rodata,
};

/// Hard limit shared with the VM's frame stacks.
pub const FRAME_STACK_MAX: usize = 128;

/// A loop context for `break` targeting.
#[derive(Debug, Clone, Copy)]
pub struct LoopCtx {
    /// Label the `break` branch targets (the loop's `POP_BLOCK`).
    pub break_label: u16,
    /// Scope-stack depth at loop entry; `break` emits one `POP_BLOCK` per
    /// scope opened since.
    pub scope_depth: usize,
    /// Local count at loop entry; `break` emits one `POP` per local
    /// declared since.
    pub symbol_depth: usize,
}

/// Mutable per-function state used during compilation, discarded after the
/// post-pass converts it to an executable.
#[derive(Debug)]
pub struct AsFrame {
    pub funcno: u32,
    /// Declared local names, in stack-slot order. Position = AP-relative
    /// slot index.
    symbols: Vec<StringId>,
    /// Local-count marks for open `{…}` scopes.
    scopes: Vec<usize>,
    /// Argument names, in FP-relative slot order.
    args: Vec<StringId>,
    /// Captured closure names, in CP-relative cell order.
    closures: Vec<StringId>,
    pub instr: Vec<Instr>,
    pub rodata: Vec<Rodata>,
    /// Label table: label index → instruction index.
    pub labels: Vec<u16>,
    /// Open loops, innermost last.
    pub loops: Vec<LoopCtx>,
    pub file_line: u32,
}

impl AsFrame {
    #[must_use]
    pub fn new(funcno: u32, file_line: u32) -> Self {
        Self {
            funcno,
            symbols: Vec::new(),
            scopes: Vec::new(),
            args: Vec::new(),
            closures: Vec::new(),
            instr: Vec::new(),
            rodata: Vec::new(),
            labels: Vec::new(),
            loops: Vec::new(),
            file_line,
        }
    }

    pub fn emit(&mut self, code: Opcode, arg1: u8, arg2: i16) {
        self.instr.push(Instr::new(code, arg1, arg2));
    }

    /// Reserves a new label slot, to be pinned later with `set_label`.
    pub fn next_label(&mut self) -> RunResult<u16> {
        let idx = self.labels.len();
        if idx > usize::from(u16::MAX) {
            return Err(RunError::parser("too many branch targets in one function"));
        }
        self.labels.push(0);
        Ok(idx as u16)
    }

    /// Pins a label to the next instruction to be emitted.
    pub fn set_label(&mut self, label: u16) {
        self.labels[usize::from(label)] = self.instr.len() as u16;
    }

    /// Finds an existing rodata slot holding the same constant, or appends.
    pub fn seek_or_add_const(&mut self, value: Rodata) -> RunResult<i16> {
        if let Some(idx) = self.rodata.iter().position(|r| r.same_const(&value)) {
            return Ok(idx as i16);
        }
        let idx = self.rodata.len();
        i16::try_from(idx).map_err(|_| RunError::parser("too many constants in one function"))?;
        self.rodata.push(value);
        Ok(idx as i16)
    }

    // --- symbol tables ---

    /// Declares a local, returning its AP-relative slot. Redeclaration in
    /// any namespace of this frame is an error.
    pub fn declare_local(&mut self, name: StringId, text: &str) -> RunResult<i16> {
        if self.symbols.len() >= FRAME_STACK_MAX {
            return Err(RunError::parser("too many locals in one function"));
        }
        if self.symbols.contains(&name) || self.args.contains(&name) || self.closures.contains(&name) {
            return Err(RunError::parser(format!("redefinition of '{text}'")));
        }
        self.symbols.push(name);
        Ok((self.symbols.len() - 1) as i16)
    }

    pub fn declare_arg(&mut self, name: StringId, text: &str) -> RunResult<i16> {
        if self.args.len() >= FRAME_STACK_MAX {
            return Err(RunError::parser("too many arguments in one function"));
        }
        if self.args.contains(&name) {
            return Err(RunError::parser(format!("duplicate argument '{text}'")));
        }
        self.args.push(name);
        Ok((self.args.len() - 1) as i16)
    }

    pub fn declare_closure(&mut self, name: StringId) -> RunResult<i16> {
        if self.closures.len() >= FRAME_STACK_MAX {
            return Err(RunError::parser("too many closure captures in one function"));
        }
        self.closures.push(name);
        Ok((self.closures.len() - 1) as i16)
    }

    #[must_use]
    pub fn seek_local(&self, name: StringId) -> Option<i16> {
        // Reverse scan so inner declarations shadow outer ones.
        self.symbols.iter().rposition(|&s| s == name).map(|i| i as i16)
    }

    #[must_use]
    pub fn seek_arg(&self, name: StringId) -> Option<i16> {
        self.args.iter().position(|&s| s == name).map(|i| i as i16)
    }

    #[must_use]
    pub fn seek_closure(&self, name: StringId) -> Option<i16> {
        self.closures.iter().position(|&s| s == name).map(|i| i as i16)
    }

    #[must_use]
    pub fn has_symbol(&self, name: StringId) -> bool {
        self.seek_local(name).is_some() || self.seek_arg(name).is_some() || self.seek_closure(name).is_some()
    }

    #[must_use]
    pub fn n_locals(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn n_args(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Opens a `{…}` scope: remembers the local count to restore at exit.
    pub fn push_scope(&mut self) {
        self.scopes.push(self.symbols.len());
    }

    /// Closes a scope, forgetting its locals. Returns how many runtime
    /// stack slots the caller must pop.
    pub fn pop_scope(&mut self) -> usize {
        let mark = self.scopes.pop().expect("scope underflow");
        let n = self.symbols.len() - mark;
        self.symbols.truncate(mark);
        n
    }
}
