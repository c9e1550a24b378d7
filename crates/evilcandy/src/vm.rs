//! The stack virtual machine.
//!
//! A classic frame-per-call design: each frame owns its program counter and
//! a bounded data stack holding arguments, locals, and expression
//! temporaries in one region. Execution is single-threaded and runs to
//! completion or to an unhandled error; reentry (builtins invoking user
//! callbacks, `load`) nests additional run loops to a bounded depth.
//!
//! Errors propagate as `Err` up the instruction handlers; the run loop
//! stamps provenance and disposes every frame it opened before handing the
//! error to the caller.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    builtins,
    code::{Opcode, iarg},
    exc::{RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::StringId,
    ops,
    run::Interp,
    types::{BuiltinMethod, Cell, Function, Method},
    value::{SlotRef, Value},
    xptr::{Rodata, Xptr},
};

/// Per-frame data stack capacity.
pub(crate) const FRAME_STACK_MAX: usize = 128;
/// Maximum call-frame depth.
const FRAME_NEST_MAX: usize = 128;
/// Maximum reentrant VM invocations (builtin callbacks, `load`).
pub(crate) const REENT_MAX: usize = 128;

/// Runtime block-stack entry, pushed by `PUSH_BLOCK`.
#[derive(Debug, Clone, Copy)]
struct Block {
    kind: u8,
    /// Data-stack height at block entry; `POP_BLOCK` trims back to it.
    height: usize,
}

/// One call activation.
pub(crate) struct Frame {
    xptr: Rc<Xptr>,
    pc: usize,
    /// Arguments, then locals, then expression temporaries.
    stack: Vec<Value>,
    /// Argument count; locals begin at this index.
    ap: usize,
    /// The `this` object.
    owner: Value,
    /// The function value being executed; `None` for script bodies.
    func: Option<Value>,
    /// Closure cell ids, borrowed from the function value (which the
    /// `func` field keeps alive).
    closure: Vec<HeapId>,
    blocks: SmallVec<[Block; 8]>,
    /// Bindings locked by a const store.
    const_slots: Vec<SlotRef>,
}

impl Frame {
    fn new(
        xptr: Rc<Xptr>,
        stack: Vec<Value>,
        ap: usize,
        owner: Value,
        func: Option<Value>,
        closure: Vec<HeapId>,
    ) -> Self {
        Self {
            xptr,
            pc: 0,
            stack,
            ap,
            owner,
            func,
            closure,
            blocks: SmallVec::new(),
            const_slots: Vec::new(),
        }
    }
}

/// Outcome of dispatching a callee.
enum CallOutcome {
    /// A user-function frame was pushed; the run loop continues into it.
    FramePushed,
    /// A builtin completed within this tick.
    Done(Value),
}

pub(crate) struct Vm<'a> {
    pub(crate) interp: &'a mut Interp,
    frames: Vec<Frame>,
}

impl<'a> Vm<'a> {
    pub(crate) fn new(interp: &'a mut Interp) -> Self {
        Self {
            interp,
            frames: Vec::new(),
        }
    }

    /// Executes a script body to completion against the globals object.
    pub(crate) fn exec_script(&mut self, xptr: &Rc<Xptr>) -> RunResult<()> {
        let gbl = self.interp.gbl;
        self.interp.heap.inc_ref(gbl);
        let stack = self.interp.take_stack_buf();
        let frame = Frame::new(Rc::clone(xptr), stack, 0, Value::Ref(gbl), None, Vec::new());
        let base = self.frames.len();
        self.frames.push(frame);
        let result = self.run_loop(base)?;
        result.drop_with_heap(&mut self.interp.heap);
        Ok(())
    }

    /// Calls a function value from native code (builtin callbacks). This is
    /// the reentry path; depth is bounded.
    pub(crate) fn reenter(&mut self, func: &Value, owner: Option<Value>, args: Vec<Value>) -> RunResult<Value> {
        if self.interp.reent_depth >= REENT_MAX {
            for a in args {
                a.drop_with_heap(&mut self.interp.heap);
            }
            if let Some(o) = owner {
                o.drop_with_heap(&mut self.interp.heap);
            }
            return Err(RunError::runtime("reentrancy limit reached"));
        }
        self.interp.reent_depth += 1;
        let callee = func.clone_with_heap(&self.interp.heap);
        let base = self.frames.len();
        let result = match self.call_value(callee, owner, args) {
            Ok(CallOutcome::Done(v)) => Ok(v),
            Ok(CallOutcome::FramePushed) => self.run_loop(base),
            Err(e) => Err(e),
        };
        self.interp.reent_depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // The interpreter loop
    // ------------------------------------------------------------------

    /// Runs until the frame at `base` returns. On error, disposes every
    /// frame at or above `base` after stamping provenance.
    fn run_loop(&mut self, base: usize) -> RunResult<Value> {
        loop {
            match self.step(base) {
                Ok(None) => {}
                Ok(Some(result)) => return Ok(result),
                Err(e) => {
                    let e = match self.frames.last() {
                        Some(fr) => e.with_location(&fr.xptr.file_name, fr.xptr.file_line),
                        None => e,
                    };
                    self.unwind_to(base);
                    return Err(e);
                }
            }
        }
    }

    /// Executes one instruction. `Some(value)` means the frame at `base`
    /// completed.
    fn step(&mut self, base: usize) -> RunResult<Option<Value>> {
        let ii = {
            let Some(fr) = self.frames.last_mut() else {
                return Err(RunError::system("VM step with no active frame"));
            };
            let Some(ii) = fr.xptr.instr.get(fr.pc).copied() else {
                return Err(RunError::system("program counter ran off the end"));
            };
            fr.pc += 1;
            ii
        };

        match ii.code {
            Opcode::Nop => {}
            Opcode::PushConst => {
                let v = self.rodata_value(ii.arg2)?;
                self.push(v)?;
            }
            Opcode::PushLocal => self.push(Value::Null)?,
            Opcode::PushZero => self.push(Value::Int(0))?,
            Opcode::PushPtr => {
                let v = self.make_slot(ii.arg1, ii.arg2)?;
                self.push(v)?;
            }
            Opcode::PushCopy => {
                let v = self.make_slot(ii.arg1, ii.arg2)?;
                let v = self.deref(v)?;
                self.push(v)?;
            }
            Opcode::Pop | Opcode::PopLocal => {
                let v = self.pop()?;
                v.drop_with_heap(&mut self.interp.heap);
            }
            Opcode::Unwind => {
                let saved = self.pop()?;
                for _ in 0..ii.arg2 {
                    let v = self.pop()?;
                    v.drop_with_heap(&mut self.interp.heap);
                }
                self.push(saved)?;
            }

            Opcode::DefFunc => {
                let fr = self.frames.last().expect("frame");
                let Some(Rodata::Xptr(child)) = fr.xptr.rodata.get(ii.arg2.cast_unsigned() as usize) else {
                    return Err(RunError::system("DEFFUNC operand is not an executable"));
                };
                let func = Function::new(Rc::clone(child));
                let id = self.interp.heap.allocate(HeapData::Func(func));
                self.push(Value::Ref(id))?;
            }
            Opcode::AddClosure => {
                let captured = self.pop_deref()?;
                let funcv = self.pop()?;
                let cell = self.interp.heap.allocate(HeapData::Cell(Cell(captured)));
                if let Err(e) = self.with_func(&funcv, |f| f.add_closure(cell)) {
                    self.interp.heap.dec_ref(cell);
                    funcv.drop_with_heap(&mut self.interp.heap);
                    return Err(e);
                }
                self.push(funcv)?;
            }
            Opcode::AddDefault => {
                let deflt = self.pop_deref()?;
                let funcv = self.pop()?;
                let index = ii.arg2.cast_unsigned();
                let is_func = matches!(&funcv, Value::Ref(id) if matches!(self.interp.heap.get(*id), HeapData::Func(_)));
                if !is_func {
                    deflt.drop_with_heap(&mut self.interp.heap);
                    funcv.drop_with_heap(&mut self.interp.heap);
                    return Err(RunError::system("function binding on a non-function"));
                }
                self.with_func(&funcv, |f| f.add_default(index, deflt))?;
                self.push(funcv)?;
            }
            Opcode::DefList => {
                let id = self.interp.heap.allocate(HeapData::List(crate::types::List::new()));
                self.push(Value::Ref(id))?;
            }
            Opcode::ListAppend => {
                let child = self.pop_deref()?;
                let listv = self.pop()?;
                let check = match &listv {
                    Value::Ref(id) => match self.interp.heap.get(*id) {
                        HeapData::List(l) => l.check_unlocked(),
                        _ => Err(RunError::system("LIST_APPEND on a non-list")),
                    },
                    _ => Err(RunError::system("LIST_APPEND on a non-list")),
                };
                if let Err(e) = check {
                    child.drop_with_heap(&mut self.interp.heap);
                    listv.drop_with_heap(&mut self.interp.heap);
                    return Err(e);
                }
                let Value::Ref(id) = &listv else {
                    unreachable!("checked list above");
                };
                let HeapData::List(l) = self.interp.heap.get_mut(*id) else {
                    unreachable!("checked list above");
                };
                l.push(child);
                self.push(listv)?;
            }
            Opcode::DefDict => {
                let id = self.interp.heap.allocate(HeapData::Dict(crate::types::Dict::new()));
                self.push(Value::Ref(id))?;
            }
            Opcode::AddAttr => {
                let val = self.pop_deref()?;
                let objv = self.pop()?;
                let name = self.rodata_str(ii.arg2)?;
                let constant = ii.arg1 & iarg::ATTR_FLAG_CONST != 0;
                let private = ii.arg1 & iarg::ATTR_FLAG_PRIVATE != 0;
                let name_text = self.interp.interns.get_str(name).to_owned();
                let store = match &objv {
                    Value::Ref(id) => match self.interp.heap.get(*id) {
                        HeapData::Dict(d) => d.check_store(&name_text).map(|()| *id),
                        _ => Err(RunError::system("ADDATTR on a non-dict")),
                    },
                    _ => Err(RunError::system("ADDATTR on a non-dict")),
                };
                match store {
                    Ok(id) => {
                        let old = {
                            let HeapData::Dict(d) = self.interp.heap.get_mut(id) else {
                                unreachable!("checked dict above");
                            };
                            d.insert(&name_text, val, constant, private)
                        };
                        if let Some(old) = old {
                            old.drop_with_heap(&mut self.interp.heap);
                        }
                        self.push(objv)?;
                    }
                    Err(e) => {
                        val.drop_with_heap(&mut self.interp.heap);
                        objv.drop_with_heap(&mut self.interp.heap);
                        return Err(e);
                    }
                }
            }

            Opcode::Assign
            | Opcode::AssignAdd
            | Opcode::AssignSub
            | Opcode::AssignMul
            | Opcode::AssignDiv
            | Opcode::AssignMod
            | Opcode::AssignXor
            | Opcode::AssignLs
            | Opcode::AssignRs
            | Opcode::AssignOr
            | Opcode::AssignAnd => self.do_assign(ii.code, ii.arg1)?,

            Opcode::GetAttr => self.do_getattr(ii.arg1, ii.arg2)?,
            Opcode::SetAttr => self.do_setattr(ii.arg1, ii.arg2)?,

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Lshift
            | Opcode::Rshift
            | Opcode::BinaryAnd
            | Opcode::BinaryOr
            | Opcode::BinaryXor
            | Opcode::LogicalOr
            | Opcode::LogicalAnd => {
                let rhs = self.pop_deref()?;
                let lhs = self.pop_deref()?;
                let res = ops::binary_op(ii.code, &lhs, &rhs, &mut self.interp.heap, &self.interp.interns);
                lhs.drop_with_heap(&mut self.interp.heap);
                rhs.drop_with_heap(&mut self.interp.heap);
                self.push(res?)?;
            }
            Opcode::Negate | Opcode::BitwiseNot | Opcode::LogicalNot => {
                let v = self.pop_deref()?;
                let res = ops::unary_op(ii.code, &v, &self.interp.heap, &self.interp.interns);
                v.drop_with_heap(&mut self.interp.heap);
                self.push(res?)?;
            }
            Opcode::Incr | Opcode::Decr => {
                let v = self.pop()?;
                if let Value::Slot(slot) = v {
                    let cur = self.read_slot(slot)?;
                    let res = ops::unary_op(ii.code, &cur, &self.interp.heap, &self.interp.interns);
                    cur.drop_with_heap(&mut self.interp.heap);
                    self.store_slot(slot, res?, 0)?;
                } else {
                    v.drop_with_heap(&mut self.interp.heap);
                }
            }

            Opcode::Cmp => {
                let rhs = self.pop_deref()?;
                let lhs = self.pop_deref()?;
                let res = ops::compare(ii.arg1, &lhs, &rhs, &self.interp.heap, &self.interp.interns);
                lhs.drop_with_heap(&mut self.interp.heap);
                rhs.drop_with_heap(&mut self.interp.heap);
                self.push(res?)?;
            }

            Opcode::B => self.jump(ii.arg2)?,
            Opcode::BIf => {
                let v = self.pop_deref()?;
                let cond = v.truthy(&self.interp.heap, &self.interp.interns);
                v.drop_with_heap(&mut self.interp.heap);
                if cond == (ii.arg1 != 0) {
                    self.jump(ii.arg2)?;
                }
            }
            Opcode::PushBlock => {
                let fr = self.frames.last_mut().expect("frame");
                let block = Block {
                    kind: ii.arg1,
                    height: fr.stack.len(),
                };
                fr.blocks.push(block);
            }
            Opcode::PopBlock => {
                let Some(block) = self.frames.last_mut().expect("frame").blocks.pop() else {
                    return Err(RunError::system("POP_BLOCK with an empty block stack"));
                };
                while self.frames.last().expect("frame").stack.len() > block.height {
                    let v = self.pop()?;
                    v.drop_with_heap(&mut self.interp.heap);
                }
            }
            Opcode::ForeachIter => self.do_foreach_iter(ii.arg2)?,

            Opcode::CallFunc => {
                let argc = ii.arg2.cast_unsigned() as usize;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop_deref()?);
                }
                args.reverse();
                let callee = self.pop_deref()?;
                let owner = if ii.arg1 == iarg::WITH_PARENT {
                    Some(self.pop_deref()?)
                } else {
                    None
                };
                match self.call_value(callee, owner, args)? {
                    CallOutcome::Done(v) => self.push(v)?,
                    CallOutcome::FramePushed => {}
                }
            }
            Opcode::ReturnValue => {
                let result = self.pop_deref()?;
                let frame = self.frames.pop().expect("frame");
                self.dispose_frame(frame);
                if self.frames.len() == base {
                    return Ok(Some(result));
                }
                self.push(result)?;
            }

            Opcode::Symtab => {
                let name = self.rodata_str(ii.arg2)?;
                self.interp.globals.declare(name);
            }
            Opcode::Load => {
                let name = self.rodata_str(ii.arg2)?;
                self.do_load(name)?;
            }
            Opcode::End => {
                let frame = self.frames.pop().expect("frame");
                self.dispose_frame(frame);
                if self.frames.len() == base {
                    return Ok(Some(Value::Null));
                }
                // A loaded script finished; the loader continues with a
                // balanced stack.
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    fn push(&mut self, v: Value) -> RunResult<()> {
        let fr = self.frames.last_mut().expect("no frame");
        if fr.stack.len() >= FRAME_STACK_MAX {
            v.drop_with_heap(&mut self.interp.heap);
            return Err(RunError::runtime("frame stack overflow"));
        }
        fr.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.frames
            .last_mut()
            .expect("no frame")
            .stack
            .pop()
            .ok_or_else(|| RunError::system("frame stack underflow"))
    }

    fn pop_deref(&mut self) -> RunResult<Value> {
        let v = self.pop()?;
        self.deref(v)
    }

    /// Resolves a slot reference to the value it names; other values pass
    /// through unchanged.
    fn deref(&mut self, v: Value) -> RunResult<Value> {
        match v {
            Value::Slot(slot) => self.read_slot(slot),
            other => Ok(other),
        }
    }

    fn jump(&mut self, offset: i16) -> RunResult<()> {
        let fr = self.frames.last_mut().expect("frame");
        let target = i64::try_from(fr.pc).expect("pc fits i64") + i64::from(offset);
        fr.pc = usize::try_from(target).map_err(|_| RunError::system("branch to a negative pc"))?;
        Ok(())
    }

    fn rodata_value(&mut self, arg2: i16) -> RunResult<Value> {
        let fr = self.frames.last().expect("frame");
        let Some(rod) = fr.xptr.rodata.get(arg2.cast_unsigned() as usize) else {
            return Err(RunError::system("rodata index out of range"));
        };
        match rod {
            Rodata::Empty => Ok(Value::Null),
            Rodata::Int(v) => Ok(Value::Int(*v)),
            Rodata::Float(v) => Ok(Value::Float(*v)),
            Rodata::Str(id) => Ok(Value::Str(*id)),
            Rodata::Bytes(id) => Ok(Value::Bytes(*id)),
            Rodata::Xptr(_) => Err(RunError::system("cannot push an executable constant")),
        }
    }

    fn rodata_str(&mut self, arg2: i16) -> RunResult<StringId> {
        let fr = self.frames.last().expect("frame");
        match fr.xptr.rodata.get(arg2.cast_unsigned() as usize) {
            Some(Rodata::Str(id)) => Ok(*id),
            _ => Err(RunError::system("rodata slot is not a name string")),
        }
    }

    fn make_slot(&mut self, mode: u8, arg2: i16) -> RunResult<Value> {
        match mode {
            iarg::PTR_AP => Ok(Value::Slot(SlotRef::Local(arg2.cast_unsigned()))),
            iarg::PTR_FP => Ok(Value::Slot(SlotRef::Arg(arg2.cast_unsigned()))),
            iarg::PTR_CP => Ok(Value::Slot(SlotRef::Closure(arg2.cast_unsigned()))),
            iarg::PTR_SEEK => {
                let name = self.rodata_str(arg2)?;
                Ok(Value::Slot(SlotRef::Global(name)))
            }
            iarg::PTR_GBL => {
                let gbl = self.interp.gbl;
                self.interp.heap.inc_ref(gbl);
                Ok(Value::Ref(gbl))
            }
            iarg::PTR_THIS => Ok(Value::Slot(SlotRef::This)),
            _ => Err(RunError::system(format!("bad PUSH_PTR mode {mode}"))),
        }
    }

    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    fn read_slot(&mut self, slot: SlotRef) -> RunResult<Value> {
        let fr = self.frames.last().expect("frame");
        match slot {
            SlotRef::Local(i) => {
                let idx = fr.ap + usize::from(i);
                fr.stack
                    .get(idx)
                    .map(|v| v.clone_with_heap(&self.interp.heap))
                    .ok_or_else(|| RunError::system("local slot out of range"))
            }
            SlotRef::Arg(i) => {
                let idx = usize::from(i);
                fr.stack
                    .get(idx)
                    .map(|v| v.clone_with_heap(&self.interp.heap))
                    .ok_or_else(|| RunError::runtime("argument not supplied"))
            }
            SlotRef::Closure(i) => {
                let Some(&cell) = fr.closure.get(usize::from(i)) else {
                    return Err(RunError::system("closure cell out of range"));
                };
                match self.interp.heap.get(cell) {
                    HeapData::Cell(c) => Ok(c.0.clone_with_heap(&self.interp.heap)),
                    _ => Err(RunError::system("closure slot is not a cell")),
                }
            }
            SlotRef::Global(name) => self.seek_global(name),
            SlotRef::This => Ok(fr.owner.clone_with_heap(&self.interp.heap)),
        }
    }

    /// Runtime symbol search: the globals table, then attributes of the
    /// owning object, then attributes of the globals object.
    fn seek_global(&mut self, name: StringId) -> RunResult<Value> {
        if let Some(entry) = self.interp.globals.get(name) {
            return Ok(entry.value.clone_with_heap(&self.interp.heap));
        }
        let text = self.interp.interns.get_str(name).to_owned();
        let owner = &self.frames.last().expect("frame").owner;
        if let Value::Ref(id) = owner
            && let HeapData::Dict(d) = self.interp.heap.get(*id)
            && let Some(entry) = d.get(&text)
        {
            return Ok(entry.value.clone_with_heap(&self.interp.heap));
        }
        if let HeapData::Dict(d) = self.interp.heap.get(self.interp.gbl)
            && let Some(entry) = d.get(&text)
        {
            return Ok(entry.value.clone_with_heap(&self.interp.heap));
        }
        Err(RunError::runtime(format!("symbol '{text}' not found")))
    }

    fn store_slot(&mut self, slot: SlotRef, value: Value, arg1: u8) -> RunResult<()> {
        let make_const = arg1 & iarg::FLAG_CONST != 0;

        if self.frames.last().expect("frame").const_slots.contains(&slot) {
            value.drop_with_heap(&mut self.interp.heap);
            return Err(RunError::runtime("cannot assign to a const binding"));
        }

        match slot {
            SlotRef::Local(i) => {
                let idx = self.frames.last().expect("frame").ap + usize::from(i);
                self.store_stack_slot(idx, value)?;
            }
            SlotRef::Arg(i) => {
                self.store_stack_slot(usize::from(i), value)?;
            }
            SlotRef::Closure(i) => {
                let Some(&cell) = self.frames.last().expect("frame").closure.get(usize::from(i)) else {
                    value.drop_with_heap(&mut self.interp.heap);
                    return Err(RunError::system("closure cell out of range"));
                };
                let old = match self.interp.heap.get_mut(cell) {
                    HeapData::Cell(c) => std::mem::replace(&mut c.0, value),
                    _ => {
                        return Err(RunError::system("closure slot is not a cell"));
                    }
                };
                old.drop_with_heap(&mut self.interp.heap);
            }
            SlotRef::Global(name) => {
                return self.store_global(name, value, make_const);
            }
            SlotRef::This => {
                value.drop_with_heap(&mut self.interp.heap);
                return Err(RunError::type_error("cannot assign to 'this'"));
            }
        }

        if make_const {
            self.frames.last_mut().expect("frame").const_slots.push(slot);
        }
        Ok(())
    }

    fn store_stack_slot(&mut self, idx: usize, value: Value) -> RunResult<()> {
        let fr = self.frames.last_mut().expect("frame");
        if idx >= fr.stack.len() {
            value.drop_with_heap(&mut self.interp.heap);
            return Err(RunError::system("store to a slot out of range"));
        }
        let old = std::mem::replace(&mut fr.stack[idx], value);
        old.drop_with_heap(&mut self.interp.heap);
        Ok(())
    }

    fn store_global(&mut self, name: StringId, value: Value, make_const: bool) -> RunResult<()> {
        if self.interp.globals.contains(name) {
            return self
                .interp
                .globals
                .set(name, value, make_const, &mut self.interp.heap, &self.interp.interns);
        }
        // Fall back to an existing attribute of the globals object.
        let text = self.interp.interns.get_str(name).to_owned();
        let gbl = self.interp.gbl;
        let has = matches!(self.interp.heap.get(gbl), HeapData::Dict(d) if d.has(&text));
        if has {
            let check = {
                let HeapData::Dict(d) = self.interp.heap.get(gbl) else {
                    unreachable!("globals object is a dict");
                };
                d.check_store(&text)
            };
            if let Err(e) = check {
                value.drop_with_heap(&mut self.interp.heap);
                return Err(e);
            }
            let old = {
                let HeapData::Dict(d) = self.interp.heap.get_mut(gbl) else {
                    unreachable!("globals object is a dict");
                };
                d.insert(&text, value, false, false)
            };
            if let Some(old) = old {
                old.drop_with_heap(&mut self.interp.heap);
            }
            return Ok(());
        }
        value.drop_with_heap(&mut self.interp.heap);
        Err(RunError::runtime(format!("symbol '{text}' not found")))
    }

    // ------------------------------------------------------------------
    // Assignments and attributes
    // ------------------------------------------------------------------

    fn do_assign(&mut self, op: Opcode, arg1: u8) -> RunResult<()> {
        let from = self.pop_deref()?;
        let target = self.pop()?;
        let Value::Slot(slot) = target else {
            from.drop_with_heap(&mut self.interp.heap);
            target.drop_with_heap(&mut self.interp.heap);
            return Err(RunError::type_error("assignment target is not assignable"));
        };

        if op == Opcode::Assign {
            return self.store_slot(slot, from, arg1);
        }

        let binop = match op {
            Opcode::AssignAdd => Opcode::Add,
            Opcode::AssignSub => Opcode::Sub,
            Opcode::AssignMul => Opcode::Mul,
            Opcode::AssignDiv => Opcode::Div,
            Opcode::AssignMod => Opcode::Mod,
            Opcode::AssignXor => Opcode::BinaryXor,
            Opcode::AssignLs => Opcode::Lshift,
            Opcode::AssignRs => Opcode::Rshift,
            Opcode::AssignOr => Opcode::BinaryOr,
            Opcode::AssignAnd => Opcode::BinaryAnd,
            _ => unreachable!("assign family checked by caller"),
        };
        let cur = self.read_slot(slot)?;
        let res = ops::binary_op(binop, &cur, &from, &mut self.interp.heap, &self.interp.interns);
        cur.drop_with_heap(&mut self.interp.heap);
        from.drop_with_heap(&mut self.interp.heap);
        self.store_slot(slot, res?, 0)
    }

    fn do_getattr(&mut self, arg1: u8, arg2: i16) -> RunResult<()> {
        let key = if arg1 == iarg::ATTR_STACK {
            self.pop_deref()?
        } else {
            self.rodata_value(arg2)?
        };
        let obj = self.pop_deref()?;
        let attr = self.get_attr(&obj, &key);
        key.drop_with_heap(&mut self.interp.heap);
        match attr {
            Ok(a) => {
                // The object stays beneath the attribute: a following call
                // needs its receiver (resolved later by UNWIND).
                self.push(obj)?;
                self.push(a)
            }
            Err(e) => {
                obj.drop_with_heap(&mut self.interp.heap);
                Err(e)
            }
        }
    }

    fn get_attr(&mut self, obj: &Value, key: &Value) -> RunResult<Value> {
        if let Some(name) = key.as_str(&self.interp.heap, &self.interp.interns) {
            let name = name.to_owned();
            return self.get_attr_named(obj, &name);
        }
        if let Value::Int(idx) = key {
            return self.getitem_int(obj, *idx);
        }
        Err(RunError::type_error("subscript must be a string or an integer"))
    }

    fn get_attr_named(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        if let Value::Ref(id) = obj
            && matches!(self.interp.heap.get(*id), HeapData::Dict(_))
        {
            let id = *id;
            let hit = {
                let HeapData::Dict(d) = self.interp.heap.get(id) else {
                    unreachable!("checked dict above");
                };
                match d.get(name) {
                    Some(entry) if entry.private && !self.is_frame_owner(id) => {
                        Some(Err(RunError::attribute_error("dict", name)))
                    }
                    Some(entry) => Some(Ok(entry.value.clone_with_heap(&self.interp.heap))),
                    None => None,
                }
            };
            if let Some(result) = hit {
                return result;
            }
            if let Some(m) = BuiltinMethod::lookup(crate::types::Type::Dict, name) {
                return Ok(self.bind_method(obj, m));
            }
            return Err(RunError::key_error(name));
        }

        let ty = obj.type_of(&self.interp.heap);
        match BuiltinMethod::lookup(ty, name) {
            Some(m) => Ok(self.bind_method(obj, m)),
            None => Err(RunError::attribute_error(ty.name(), name)),
        }
    }

    fn bind_method(&mut self, owner: &Value, method: BuiltinMethod) -> Value {
        let owner = owner.clone_with_heap(&self.interp.heap);
        let id = self.interp.heap.allocate(HeapData::Method(Method { owner, method }));
        Value::Ref(id)
    }

    fn is_frame_owner(&self, id: HeapId) -> bool {
        matches!(self.frames.last().map(|fr| &fr.owner), Some(Value::Ref(o)) if *o == id)
    }

    fn getitem_int(&mut self, obj: &Value, idx: i64) -> RunResult<Value> {
        let heap = &self.interp.heap;
        let out_of_range = || RunError::value_error(format!("index {idx} out of range"));
        match obj {
            Value::Str(sid) => {
                let c = self.interp.interns.get(*sid).char_at(idx).ok_or_else(out_of_range)?;
                let id = self
                    .interp
                    .heap
                    .allocate(HeapData::Str(crate::types::str::EcStr::new(c.to_string())));
                Ok(Value::Ref(id))
            }
            Value::Bytes(bid) => {
                let len = self.interp.interns.get_bytes(*bid).len() as i64;
                let i = if idx < 0 { idx + len } else { idx };
                if i < 0 || i >= len {
                    return Err(out_of_range());
                }
                Ok(Value::Int(i64::from(self.interp.interns.get_bytes(*bid)[i as usize])))
            }
            Value::Ref(id) => match heap.get(*id) {
                HeapData::List(l) => l
                    .get(idx)
                    .map(|v| v.clone_with_heap(heap))
                    .ok_or_else(out_of_range),
                HeapData::Tuple(t) => t
                    .get(idx)
                    .map(|v| v.clone_with_heap(heap))
                    .ok_or_else(out_of_range),
                HeapData::Floats(f) => f.get(idx).map(Value::Float).ok_or_else(out_of_range),
                HeapData::Range(r) => r.get(idx).map(Value::Int).ok_or_else(out_of_range),
                HeapData::Str(s) => {
                    let c = s.char_at(idx).ok_or_else(out_of_range)?;
                    let id = self
                        .interp
                        .heap
                        .allocate(HeapData::Str(crate::types::str::EcStr::new(c.to_string())));
                    Ok(Value::Ref(id))
                }
                HeapData::Bytes(b) => b.byte_at(idx).map(|v| Value::Int(i64::from(v))).ok_or_else(out_of_range),
                HeapData::Dict(_) => Err(RunError::type_error("dict subscript must be a string")),
                _ => Err(RunError::type_error(format!(
                    "{} is not subscriptable",
                    obj.type_of(heap).name()
                ))),
            },
            _ => Err(RunError::type_error(format!(
                "{} is not subscriptable",
                obj.type_of(heap).name()
            ))),
        }
    }

    fn do_setattr(&mut self, arg1: u8, arg2: i16) -> RunResult<()> {
        let val = self.pop_deref()?;
        let key = if arg1 == iarg::ATTR_STACK {
            self.pop_deref()?
        } else {
            self.rodata_value(arg2)?
        };
        let obj = self.pop_deref()?;
        let res = self.set_attr(&obj, &key, val);
        key.drop_with_heap(&mut self.interp.heap);
        obj.drop_with_heap(&mut self.interp.heap);
        res
    }

    fn set_attr(&mut self, obj: &Value, key: &Value, val: Value) -> RunResult<()> {
        if let Some(name) = key.as_str(&self.interp.heap, &self.interp.interns) {
            let name = name.to_owned();
            let Value::Ref(id) = obj else {
                val.drop_with_heap(&mut self.interp.heap);
                return Err(RunError::attribute_error(obj.type_of(&self.interp.heap).name(), &name));
            };
            let id = *id;
            let HeapData::Dict(d) = self.interp.heap.get(id) else {
                val.drop_with_heap(&mut self.interp.heap);
                return Err(RunError::attribute_error(obj.type_of(&self.interp.heap).name(), &name));
            };
            if let Some(entry) = d.get(&name)
                && entry.private
                && !self.is_frame_owner(id)
            {
                val.drop_with_heap(&mut self.interp.heap);
                return Err(RunError::attribute_error("dict", &name));
            }
            let check = {
                let HeapData::Dict(d) = self.interp.heap.get(id) else {
                    unreachable!("checked dict above");
                };
                d.check_store(&name)
            };
            if let Err(e) = check {
                val.drop_with_heap(&mut self.interp.heap);
                return Err(e);
            }
            let old = {
                let HeapData::Dict(d) = self.interp.heap.get_mut(id) else {
                    unreachable!("checked dict above");
                };
                d.insert(&name, val, false, false)
            };
            if let Some(old) = old {
                old.drop_with_heap(&mut self.interp.heap);
            }
            return Ok(());
        }

        if let Value::Int(idx) = key {
            let idx = *idx;
            let Value::Ref(id) = obj else {
                val.drop_with_heap(&mut self.interp.heap);
                return Err(RunError::type_error("value is not index-assignable"));
            };
            let id = *id;
            match self.interp.heap.get_mut(id) {
                HeapData::List(_) => {
                    let check = {
                        let HeapData::List(l) = self.interp.heap.get(id) else {
                            unreachable!("matched list above");
                        };
                        l.check_unlocked()
                    };
                    if let Err(e) = check {
                        val.drop_with_heap(&mut self.interp.heap);
                        return Err(e);
                    }
                    let stored = {
                        let HeapData::List(l) = self.interp.heap.get_mut(id) else {
                            unreachable!("matched list above");
                        };
                        l.set(idx, val)
                    };
                    match stored {
                        Ok(old) => {
                            old.drop_with_heap(&mut self.interp.heap);
                            Ok(())
                        }
                        Err(rejected) => {
                            rejected.drop_with_heap(&mut self.interp.heap);
                            Err(RunError::value_error(format!("index {idx} out of range")))
                        }
                    }
                }
                HeapData::Floats(f) => {
                    let x = match &val {
                        Value::Int(v) => *v as f64,
                        Value::Float(v) => *v,
                        _ => {
                            let e = RunError::type_error("floats elements must be numeric");
                            val.drop_with_heap(&mut self.interp.heap);
                            return Err(e);
                        }
                    };
                    if f.set(idx, x) {
                        Ok(())
                    } else {
                        Err(RunError::value_error(format!("index {idx} out of range")))
                    }
                }
                _ => {
                    val.drop_with_heap(&mut self.interp.heap);
                    Err(RunError::type_error("value is not index-assignable"))
                }
            }
        } else {
            val.drop_with_heap(&mut self.interp.heap);
            Err(RunError::type_error("subscript must be a string or an integer"))
        }
    }

    fn do_foreach_iter(&mut self, offset: i16) -> RunResult<()> {
        let (seq, idx) = {
            let fr = self.frames.last().expect("frame");
            let n = fr.stack.len();
            if n < 2 {
                return Err(RunError::system("FOREACH_ITER needs a sequence and a counter"));
            }
            let Value::Int(idx) = fr.stack[n - 1] else {
                return Err(RunError::system("FOREACH_ITER counter is not an integer"));
            };
            (fr.stack[n - 2].clone_with_heap(&self.interp.heap), idx)
        };
        let len = seq
            .seq_len(&self.interp.heap, &self.interp.interns)
            .ok_or_else(|| RunError::type_error("value is not iterable"))?;
        let result = if (idx as usize) < len {
            let elem = self.getitem_int(&seq, idx)?;
            let fr = self.frames.last_mut().expect("frame");
            let n = fr.stack.len();
            fr.stack[n - 1] = Value::Int(idx + 1);
            self.push(elem)
        } else {
            self.jump(offset)
        };
        seq.drop_with_heap(&mut self.interp.heap);
        result
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Dispatches a call. Consumes the callee, optional receiver, and
    /// arguments in every path, success or failure.
    fn call_value(&mut self, callee: Value, owner: Option<Value>, args: Vec<Value>) -> RunResult<CallOutcome> {
        enum Target {
            User,
            Native(BuiltinMethod, Value),
            Global(crate::builtins::BuiltinFn),
            NotCallable,
        }

        let target = match &callee {
            Value::Ref(id) => match self.interp.heap.get(*id) {
                HeapData::Func(_) => Target::User,
                HeapData::Method(m) => Target::Native(m.method, m.owner.clone_with_heap(&self.interp.heap)),
                _ => Target::NotCallable,
            },
            Value::Builtin(f) => Target::Global(*f),
            _ => Target::NotCallable,
        };

        match target {
            Target::User => self.push_call_frame(callee, owner, args).map(|()| CallOutcome::FramePushed),
            Target::Native(method, method_owner) => {
                if let Some(o) = owner {
                    o.drop_with_heap(&mut self.interp.heap);
                }
                callee.drop_with_heap(&mut self.interp.heap);
                let res = builtins::call_method(self, method, &method_owner, &args);
                method_owner.drop_with_heap(&mut self.interp.heap);
                for a in args {
                    a.drop_with_heap(&mut self.interp.heap);
                }
                res.map(CallOutcome::Done)
            }
            Target::Global(f) => {
                if let Some(o) = owner {
                    o.drop_with_heap(&mut self.interp.heap);
                }
                let res = builtins::call_builtin(self, f, &args);
                for a in args {
                    a.drop_with_heap(&mut self.interp.heap);
                }
                res.map(CallOutcome::Done)
            }
            Target::NotCallable => {
                let ty = callee.type_of(&self.interp.heap).name();
                callee.drop_with_heap(&mut self.interp.heap);
                if let Some(o) = owner {
                    o.drop_with_heap(&mut self.interp.heap);
                }
                for a in args {
                    a.drop_with_heap(&mut self.interp.heap);
                }
                Err(RunError::type_error(format!("{ty} is not callable")))
            }
        }
    }

    /// Builds and pushes the frame for a user-function call. Omitted
    /// trailing arguments take the function's captured defaults.
    fn push_call_frame(&mut self, callee: Value, owner: Option<Value>, args: Vec<Value>) -> RunResult<()> {
        if self.frames.len() >= FRAME_NEST_MAX {
            callee.drop_with_heap(&mut self.interp.heap);
            if let Some(o) = owner {
                o.drop_with_heap(&mut self.interp.heap);
            }
            for a in args {
                a.drop_with_heap(&mut self.interp.heap);
            }
            return Err(RunError::runtime("call stack overflow"));
        }

        let Value::Ref(fid) = &callee else {
            unreachable!("caller dispatched on Func");
        };
        let (xptr, closure, defaults) = {
            let HeapData::Func(f) = self.interp.heap.get(*fid) else {
                unreachable!("caller dispatched on Func");
            };
            let defaults: Vec<(u16, Value)> = f
                .defaults()
                .iter()
                .map(|(i, v)| (*i, v.clone_with_heap(&self.interp.heap)))
                .collect();
            (Rc::clone(f.xptr()), f.closure().to_vec(), defaults)
        };

        let mut stack = self.interp.take_stack_buf();
        let argc = args.len();
        stack.extend(args);
        let mut ap = argc;
        // Fill contiguous defaults for the arguments the caller omitted.
        let mut defaults = defaults;
        loop {
            let Some(pos) = defaults.iter().position(|(i, _)| usize::from(*i) == ap) else {
                break;
            };
            let (_, v) = defaults.swap_remove(pos);
            stack.push(v);
            ap += 1;
        }
        for (_, v) in defaults {
            v.drop_with_heap(&mut self.interp.heap);
        }

        let owner = match owner {
            Some(o) => o,
            None => {
                // A plain call inherits the caller's `this`.
                match self.frames.last() {
                    Some(fr) => fr.owner.clone_with_heap(&self.interp.heap),
                    None => {
                        let gbl = self.interp.gbl;
                        self.interp.heap.inc_ref(gbl);
                        Value::Ref(gbl)
                    }
                }
            }
        };

        let frame = Frame::new(xptr, stack, ap, owner, Some(callee), closure);
        self.frames.push(frame);
        Ok(())
    }

    fn dispose_frame(&mut self, mut frame: Frame) {
        for v in frame.stack.drain(..) {
            v.drop_with_heap(&mut self.interp.heap);
        }
        frame.owner.drop_with_heap(&mut self.interp.heap);
        if let Some(f) = frame.func.take() {
            f.drop_with_heap(&mut self.interp.heap);
        }
        self.interp.return_stack_buf(frame.stack);
    }

    fn unwind_to(&mut self, base: usize) {
        while self.frames.len() > base {
            let frame = self.frames.pop().expect("frame");
            self.dispose_frame(frame);
        }
    }

    fn with_func(&mut self, funcv: &Value, f: impl FnOnce(&mut Function)) -> RunResult<()> {
        let Value::Ref(id) = funcv else {
            return Err(RunError::system("function binding on a non-function"));
        };
        match self.interp.heap.get_mut(*id) {
            HeapData::Func(func) => {
                f(func);
                Ok(())
            }
            _ => Err(RunError::system("function binding on a non-function")),
        }
    }

    // ------------------------------------------------------------------
    // load
    // ------------------------------------------------------------------

    /// Compiles and runs another source file in the current global
    /// environment. The loaded script's frame nests on top of the loader's;
    /// its `END` pops it and the loader resumes.
    fn do_load(&mut self, name: StringId) -> RunResult<()> {
        if self.frames.len() >= FRAME_NEST_MAX {
            return Err(RunError::runtime("load nesting too deep"));
        }
        let rel = self.interp.interns.get_str(name).to_owned();
        let current = self.frames.last().expect("frame").xptr.file_name.clone();
        let path = match std::path::Path::new(&current).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(&rel),
            _ => std::path::PathBuf::from(&rel),
        };
        let src = std::fs::read_to_string(&path)
            .map_err(|e| RunError::system(format!("load '{}': {e}", path.display())))?;
        let xptr = crate::assemble::assemble(&src, &path.display().to_string(), &mut self.interp.interns, &mut self.interp.heap)?;

        let gbl = self.interp.gbl;
        self.interp.heap.inc_ref(gbl);
        let stack = self.interp.take_stack_buf();
        let frame = Frame::new(xptr, stack, 0, Value::Ref(gbl), None, Vec::new());
        self.frames.push(frame);
        Ok(())
    }
}
