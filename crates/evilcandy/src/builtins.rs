//! Global built-in functions and per-type built-in methods.
//!
//! Built-ins execute entirely within one VM tick. The ones that accept
//! user callbacks (`foreach`) re-enter the VM through [`Vm::reenter`],
//! which is bounded in depth. Argument validation goes through the format
//! unpacker where the shapes fit it; variadic builtins (`print`) validate
//! by hand.

use crate::{
    args::{Unpacked, unpack_args},
    exc::{RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    ops,
    types::{BuiltinMethod, Complex, EcStr, Floats, List, Range, Tuple},
    value::{Value, display_value},
    vm::Vm,
};

/// The global builtin functions, pre-bound in the globals table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFn {
    Print,
    Typeof,
    Len,
    Range,
    Str,
    Int,
    Float,
    Complex,
    Tuple,
    Floats,
}

impl BuiltinFn {
    pub(crate) const ALL: [Self; 10] = [
        Self::Print,
        Self::Typeof,
        Self::Len,
        Self::Range,
        Self::Str,
        Self::Int,
        Self::Float,
        Self::Complex,
        Self::Tuple,
        Self::Floats,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Typeof => "typeof",
            Self::Len => "len",
            Self::Range => "range",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Complex => "complex",
            Self::Tuple => "tuple",
            Self::Floats => "floats",
        }
    }
}

pub(crate) fn call_builtin(vm: &mut Vm, f: BuiltinFn, args: &[Value]) -> RunResult<Value> {
    match f {
        BuiltinFn::Print => {
            for (i, arg) in args.iter().enumerate() {
                let text = display_value(arg, &vm.interp.heap, &vm.interp.interns);
                if i > 0 {
                    vm.interp.writer.push_char(' ');
                }
                vm.interp.writer.write_str(&text);
            }
            vm.interp.writer.push_char('\n');
            Ok(Value::Null)
        }
        BuiltinFn::Typeof => {
            let got = unpack_args(".:typeof", args, &mut vm.interp.heap, &vm.interp.interns)?;
            drop(got);
            let name = args[0].type_of(&vm.interp.heap).name();
            let id = vm.interp.interns.intern(name);
            Ok(Value::Str(id))
        }
        BuiltinFn::Len => {
            let got = unpack_args(".:len", args, &mut vm.interp.heap, &vm.interp.interns)?;
            drop(got);
            match args[0].seq_len(&vm.interp.heap, &vm.interp.interns) {
                Some(n) => Ok(Value::Int(n as i64)),
                None => Err(RunError::type_error(format!(
                    "{} has no length",
                    args[0].type_of(&vm.interp.heap).name()
                ))),
            }
        }
        BuiltinFn::Range => {
            let got = unpack_args("l|ll:range", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let (start, stop, step) = match (&got[0], &got[1], &got[2]) {
                (Unpacked::Int(stop), Unpacked::Absent, _) => (0, *stop, 1),
                (Unpacked::Int(start), Unpacked::Int(stop), Unpacked::Absent) => (*start, *stop, 1),
                (Unpacked::Int(start), Unpacked::Int(stop), Unpacked::Int(step)) => (*start, *stop, *step),
                _ => unreachable!("unpacker enforced the format"),
            };
            let r = Range::new(start, stop, step)?;
            let id = vm.interp.heap.allocate(HeapData::Range(r));
            Ok(Value::Ref(id))
        }
        BuiltinFn::Str => {
            let got = unpack_args(".:str", args, &mut vm.interp.heap, &vm.interp.interns)?;
            drop(got);
            let text = display_value(&args[0], &vm.interp.heap, &vm.interp.interns);
            let id = vm.interp.heap.allocate(HeapData::Str(EcStr::new(text)));
            Ok(Value::Ref(id))
        }
        BuiltinFn::Int => {
            let got = unpack_args("<ifs>:int", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(v)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let res = match &v {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                other => match other.as_str(&vm.interp.heap, &vm.interp.interns) {
                    Some(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| RunError::value_error(format!("cannot convert '{s}' to int"))),
                    None => unreachable!("unpacker restricted the types"),
                },
            };
            v.drop_with_heap(&mut vm.interp.heap);
            res
        }
        BuiltinFn::Float => {
            let got = unpack_args("<ifs>:float", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(v)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let res = match &v {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                other => match other.as_str(&vm.interp.heap, &vm.interp.interns) {
                    Some(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| RunError::value_error(format!("cannot convert '{s}' to float"))),
                    None => unreachable!("unpacker restricted the types"),
                },
            };
            v.drop_with_heap(&mut vm.interp.heap);
            res
        }
        BuiltinFn::Complex => {
            let got = unpack_args("f|f:complex", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let re = match got[0] {
                Unpacked::Double(v) => v,
                _ => unreachable!("unpacker enforced the format"),
            };
            let im = match got[1] {
                Unpacked::Double(v) => v,
                Unpacked::Absent => 0.0,
                _ => unreachable!("unpacker enforced the format"),
            };
            let id = vm.interp.heap.allocate(HeapData::Complex(Complex { re, im }));
            Ok(Value::Ref(id))
        }
        BuiltinFn::Tuple => {
            let got = unpack_args("<[]()>:tuple", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(v)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let Value::Ref(id) = &v else {
                unreachable!("unpacker restricted the types");
            };
            let items: Vec<Value> = match vm.interp.heap.get(*id) {
                HeapData::List(l) => l.items().iter().map(|x| x.clone_with_heap(&vm.interp.heap)).collect(),
                HeapData::Tuple(t) => t.items().iter().map(|x| x.clone_with_heap(&vm.interp.heap)).collect(),
                _ => unreachable!("unpacker restricted the types"),
            };
            v.drop_with_heap(&mut vm.interp.heap);
            let id = vm.interp.heap.allocate(HeapData::Tuple(Tuple::from_items(items)));
            Ok(Value::Ref(id))
        }
        BuiltinFn::Floats => {
            let got = unpack_args("|<[]>:floats", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let mut data = Vec::new();
            if let Some(Unpacked::Obj(v)) = got.into_iter().next() {
                let Value::Ref(id) = &v else {
                    unreachable!("unpacker restricted the types");
                };
                let HeapData::List(l) = vm.interp.heap.get(*id) else {
                    unreachable!("unpacker restricted the types");
                };
                for item in l.items() {
                    match item {
                        Value::Int(i) => data.push(*i as f64),
                        Value::Float(f) => data.push(*f),
                        _ => {
                            v.drop_with_heap(&mut vm.interp.heap);
                            return Err(RunError::type_error("floats() needs a list of numbers"));
                        }
                    }
                }
                v.drop_with_heap(&mut vm.interp.heap);
            }
            let id = vm.interp.heap.allocate(HeapData::Floats(Floats::from_values(data)));
            Ok(Value::Ref(id))
        }
    }
}

pub(crate) fn call_method(vm: &mut Vm, m: BuiltinMethod, owner: &Value, args: &[Value]) -> RunResult<Value> {
    match m {
        BuiltinMethod::StrLen
        | BuiltinMethod::BytesLen
        | BuiltinMethod::ListLen
        | BuiltinMethod::DictLen
        | BuiltinMethod::TupleLen
        | BuiltinMethod::FloatsLen
        | BuiltinMethod::RangeLen => {
            unpack_args(":len", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let n = owner
                .seq_len(&vm.interp.heap, &vm.interp.interns)
                .ok_or_else(|| RunError::system("len method bound to a lengthless value"))?;
            Ok(Value::Int(n as i64))
        }

        BuiltinMethod::StrSlice => {
            let got = unpack_args("l|l:slice", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Unpacked::Int(start) = got[0] else {
                unreachable!("unpacker enforced the format");
            };
            let stop = match got[1] {
                Unpacked::Int(v) => v,
                Unpacked::Absent => i64::MAX,
                _ => unreachable!("unpacker enforced the format"),
            };
            let sliced = match owner {
                Value::Str(id) => vm.interp.interns.get(*id).slice(start, stop),
                Value::Ref(id) => match vm.interp.heap.get(*id) {
                    HeapData::Str(s) => s.slice(start, stop),
                    _ => return Err(RunError::system("slice bound to a non-string")),
                },
                _ => return Err(RunError::system("slice bound to a non-string")),
            };
            let id = vm.interp.heap.allocate(HeapData::Str(EcStr::new(sliced)));
            Ok(Value::Ref(id))
        }
        BuiltinMethod::ListAppend => {
            let got = unpack_args("<*>:append", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(v)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let id = owner_list(owner)?;
            let check = {
                let HeapData::List(l) = vm.interp.heap.get(id) else {
                    return Err(RunError::system("append bound to a non-list"));
                };
                l.check_unlocked()
            };
            if let Err(e) = check {
                v.drop_with_heap(&mut vm.interp.heap);
                return Err(e);
            }
            let HeapData::List(l) = vm.interp.heap.get_mut(id) else {
                unreachable!("checked list above");
            };
            l.push(v);
            Ok(Value::Null)
        }
        BuiltinMethod::ListPop => {
            unpack_args(":pop", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_list(owner)?;
            let HeapData::List(l) = vm.interp.heap.get_mut(id) else {
                return Err(RunError::system("pop bound to a non-list"));
            };
            Ok(l.pop()?.unwrap_or(Value::Null))
        }
        BuiltinMethod::ListSort => {
            unpack_args(":sort", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_list(owner)?;
            let mut items = {
                let HeapData::List(l) = vm.interp.heap.get_mut(id) else {
                    return Err(RunError::system("sort bound to a non-list"));
                };
                l.check_unlocked()?;
                l.take_items()
            };
            let res = sort_values(&mut items, vm);
            let HeapData::List(l) = vm.interp.heap.get_mut(id) else {
                unreachable!("checked list above");
            };
            for v in items {
                l.push(v);
            }
            res.map(|()| Value::Null)
        }
        BuiltinMethod::ListForeach => {
            let got = unpack_args("<x>:foreach", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(func)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let id = owner_list(owner)?;
            let res = list_foreach(vm, id, &func);
            func.drop_with_heap(&mut vm.interp.heap);
            res
        }

        BuiltinMethod::DictKeys => {
            unpack_args(":keys", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_dict(owner)?;
            let keys = {
                let HeapData::Dict(d) = vm.interp.heap.get(id) else {
                    return Err(RunError::system("keys bound to a non-dict"));
                };
                d.keys_snapshot()
            };
            let items: Vec<Value> = keys
                .into_iter()
                .map(|k| Value::Ref(vm.interp.heap.allocate(HeapData::Str(EcStr::new(k.into())))))
                .collect();
            let id = vm.interp.heap.allocate(HeapData::List(List::from_items(items)));
            Ok(Value::Ref(id))
        }
        BuiltinMethod::DictHas => {
            let got = unpack_args("s:has", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Str(key)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let id = owner_dict(owner)?;
            let HeapData::Dict(d) = vm.interp.heap.get(id) else {
                return Err(RunError::system("has bound to a non-dict"));
            };
            Ok(Value::Int(i64::from(d.has(&key))))
        }
        BuiltinMethod::DictForeach => {
            let got = unpack_args("<x>:foreach", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Some(Unpacked::Obj(func)) = got.into_iter().next() else {
                unreachable!("unpacker enforced the format");
            };
            let id = owner_dict(owner)?;
            let res = dict_foreach(vm, id, &func);
            func.drop_with_heap(&mut vm.interp.heap);
            res
        }

        BuiltinMethod::FloatsAppend => {
            let got = unpack_args("f:append", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Unpacked::Double(x) = got[0] else {
                unreachable!("unpacker enforced the format");
            };
            let id = owner_floats(owner)?;
            let HeapData::Floats(f) = vm.interp.heap.get_mut(id) else {
                return Err(RunError::system("append bound to a non-floats"));
            };
            f.push(x);
            Ok(Value::Null)
        }
        BuiltinMethod::FloatsSum | BuiltinMethod::FloatsMean | BuiltinMethod::FloatsVar => {
            unpack_args(":floats", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_floats(owner)?;
            let HeapData::Floats(f) = vm.interp.heap.get_mut(id) else {
                return Err(RunError::system("statistic bound to a non-floats"));
            };
            let v = match m {
                BuiltinMethod::FloatsSum => f.sum(),
                BuiltinMethod::FloatsMean => f.mean(),
                _ => f.variance(),
            };
            Ok(Value::Float(v))
        }
        BuiltinMethod::FloatsMin | BuiltinMethod::FloatsMax => {
            unpack_args(":floats", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_floats(owner)?;
            let HeapData::Floats(f) = vm.interp.heap.get(id) else {
                return Err(RunError::system("extremum bound to a non-floats"));
            };
            let v = if m == BuiltinMethod::FloatsMin { f.min() } else { f.max() };
            v.map(Value::Float)
                .ok_or_else(|| RunError::value_error("empty floats array"))
        }
        BuiltinMethod::FloatsAny | BuiltinMethod::FloatsAll => {
            unpack_args(":floats", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let id = owner_floats(owner)?;
            let HeapData::Floats(f) = vm.interp.heap.get(id) else {
                return Err(RunError::system("predicate bound to a non-floats"));
            };
            let v = if m == BuiltinMethod::FloatsAny { f.any() } else { f.all() };
            Ok(Value::Int(i64::from(v)))
        }

        BuiltinMethod::FileClose => {
            unpack_args(":close", args, &mut vm.interp.heap, &vm.interp.interns)?;
            let Value::Ref(id) = owner else {
                return Err(RunError::system("close bound to a non-file"));
            };
            let HeapData::File(f) = vm.interp.heap.get_mut(*id) else {
                return Err(RunError::system("close bound to a non-file"));
            };
            f.close();
            Ok(Value::Null)
        }
    }
}

fn owner_list(owner: &Value) -> RunResult<HeapId> {
    match owner {
        Value::Ref(id) => Ok(*id),
        _ => Err(RunError::system("list method bound to a non-list")),
    }
}

fn owner_dict(owner: &Value) -> RunResult<HeapId> {
    match owner {
        Value::Ref(id) => Ok(*id),
        _ => Err(RunError::system("dict method bound to a non-dict")),
    }
}

fn owner_floats(owner: &Value) -> RunResult<HeapId> {
    match owner {
        Value::Ref(id) => Ok(*id),
        _ => Err(RunError::system("floats method bound to a non-floats")),
    }
}

/// `list.foreach(f)`: locks the list, calls `f(value, index)` for each
/// element, and unlocks — including on the error path. The callback sees
/// the list as `this`.
fn list_foreach(vm: &mut Vm, list_id: HeapId, func: &Value) -> RunResult<Value> {
    {
        let HeapData::List(l) = vm.interp.heap.get_mut(list_id) else {
            return Err(RunError::system("foreach bound to a non-list"));
        };
        l.lock()?;
    }

    let result = (|| {
        let mut i = 0usize;
        loop {
            let elem = {
                let HeapData::List(l) = vm.interp.heap.get(list_id) else {
                    unreachable!("locked above");
                };
                if i >= l.len() {
                    return Ok(());
                }
                l.items()[i].clone_with_heap(&vm.interp.heap)
            };
            vm.interp.heap.inc_ref(list_id);
            let ret = vm.reenter(func, Some(Value::Ref(list_id)), vec![elem, Value::Int(i as i64)])?;
            ret.drop_with_heap(&mut vm.interp.heap);
            i += 1;
        }
    })();

    if let HeapData::List(l) = vm.interp.heap.get_mut(list_id) {
        l.unlock();
    }
    result.map(|()| Value::Null)
}

/// `dict.foreach(f)`: iterates a snapshot of the keys taken at entry and
/// calls `f(value, key)` for each key still present. Mutation during the
/// walk is permitted; keys inserted after the snapshot are not visited.
fn dict_foreach(vm: &mut Vm, dict_id: HeapId, func: &Value) -> RunResult<Value> {
    let keys = {
        let HeapData::Dict(d) = vm.interp.heap.get(dict_id) else {
            return Err(RunError::system("foreach bound to a non-dict"));
        };
        d.keys_snapshot()
    };

    for key in keys {
        let value = {
            let HeapData::Dict(d) = vm.interp.heap.get(dict_id) else {
                unreachable!("checked dict above");
            };
            match d.get(&key) {
                Some(entry) => entry.value.clone_with_heap(&vm.interp.heap),
                None => continue, // removed by the callback
            }
        };
        let key_value = {
            let id = vm.interp.heap.allocate(HeapData::Str(EcStr::new(key.into())));
            Value::Ref(id)
        };
        vm.interp.heap.inc_ref(dict_id);
        let ret = vm.reenter(func, Some(Value::Ref(dict_id)), vec![value, key_value])?;
        ret.drop_with_heap(&mut vm.interp.heap);
    }
    Ok(Value::Null)
}

/// `sort()` support for lists of mutually comparable values; used by the
/// sequence protocol.
pub(crate) fn sort_values(values: &mut [Value], vm: &mut Vm) -> RunResult<()> {
    let mut err = None;
    values.sort_by(|a, b| {
        if err.is_some() {
            return std::cmp::Ordering::Equal;
        }
        match ops::compare(crate::code::iarg::LT, a, b, &vm.interp.heap, &vm.interp.interns) {
            Ok(Value::Int(1)) => std::cmp::Ordering::Less,
            Ok(_) => std::cmp::Ordering::Greater,
            Err(e) => {
                err = Some(e);
                std::cmp::Ordering::Equal
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
