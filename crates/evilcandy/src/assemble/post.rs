//! The post-pass: constant folding, NOP and rodata compaction, label
//! resolution, and tree linkage.
//!
//! Frames arrive children-first, so by the time a parent's `DEFFUNC`
//! instructions are linked, every child executable already exists.

use std::rc::Rc;

use ahash::AHashMap;
use uuid::Uuid;

use crate::{
    assemble::frame::AsFrame,
    code::{Instr, Opcode, iarg},
    exc::{RunError, RunResult},
    heap::Heap,
    intern::Interns,
    ops,
    value::Value,
    xptr::{Rodata, Xptr},
};

pub(super) fn run(
    frames: Vec<AsFrame>,
    file_name: &str,
    heap: &mut Heap,
    interns: &mut Interns,
) -> RunResult<Rc<Xptr>> {
    let mut built: AHashMap<u32, Rc<Xptr>> = AHashMap::new();
    let mut entry = None;

    for mut fr in frames {
        fold_constants(&mut fr, heap, interns)?;
        link_children(&mut fr, &built)?;
        compact_rodata(&mut fr);
        resolve_labels(&mut fr)?;

        let funcno = fr.funcno;
        let xptr = Rc::new(Xptr {
            instr: fr.instr.into_boxed_slice(),
            rodata: fr.rodata.into_boxed_slice(),
            labels: fr.labels.into_boxed_slice(),
            uuid: Uuid::new_v4().to_string(),
            file_name: file_name.to_owned(),
            file_line: fr.file_line,
        });
        if funcno == 0 {
            entry = Some(Rc::clone(&xptr));
        }
        built.insert(funcno, xptr);
    }

    entry.ok_or_else(|| RunError::system("assembly produced no entry point"))
}

/// Repeatedly replaces `PUSH_CONST a; PUSH_CONST b; <binop>` with one
/// `PUSH_CONST` of the evaluated result, using the same operator table the
/// VM uses. Errors during folding are discarded: the expression may be
/// unreachable or guarded at runtime.
fn fold_constants(fr: &mut AsFrame, heap: &mut Heap, interns: &mut Interns) -> RunResult<()> {
    loop {
        let mut reduced = false;
        let mut i = 0;
        while i + 2 < fr.instr.len() {
            if fr.instr[i].code != Opcode::PushConst
                || fr.instr[i + 1].code != Opcode::PushConst
                || !fr.instr[i + 2].code.is_foldable_binop()
            {
                i += 1;
                continue;
            }
            let (Some(left), Some(right)) = (
                rodata_to_value(&fr.rodata[fr.instr[i].arg2.cast_unsigned() as usize]),
                rodata_to_value(&fr.rodata[fr.instr[i + 1].arg2.cast_unsigned() as usize]),
            ) else {
                i += 1;
                continue;
            };
            let op = fr.instr[i + 2].code;
            let Ok(result) = ops::binary_op(op, &left, &right, heap, interns) else {
                i += 1;
                continue;
            };
            let Some(folded) = value_to_rodata(result, heap, interns) else {
                i += 1;
                continue;
            };
            fr.instr[i].arg2 = fr.seek_or_add_const(folded)?;
            fr.instr[i + 1] = Instr::new(Opcode::Nop, 0, 0);
            fr.instr[i + 2] = Instr::new(Opcode::Nop, 0, 0);
            i += 3;
            reduced = true;
        }
        if !reduced {
            return Ok(());
        }
        compact_nops(fr);
    }
}

fn rodata_to_value(rod: &Rodata) -> Option<Value> {
    match rod {
        Rodata::Empty => Some(Value::Null),
        Rodata::Int(v) => Some(Value::Int(*v)),
        Rodata::Float(v) => Some(Value::Float(*v)),
        Rodata::Str(id) => Some(Value::Str(*id)),
        Rodata::Bytes(id) => Some(Value::Bytes(*id)),
        Rodata::Xptr(_) => None,
    }
}

/// Converts a folded result back into a constant, interning dynamic
/// strings/bytes. Results with no rodata representation abort the fold.
fn value_to_rodata(value: Value, heap: &mut Heap, interns: &mut Interns) -> Option<Rodata> {
    let rod = match &value {
        Value::Null => Some(Rodata::Empty),
        Value::Int(v) => Some(Rodata::Int(*v)),
        Value::Float(v) => Some(Rodata::Float(*v)),
        Value::Str(id) => Some(Rodata::Str(*id)),
        Value::Bytes(id) => Some(Rodata::Bytes(*id)),
        Value::Ref(_) => {
            if let Some(s) = value.as_str(heap, interns) {
                let s = s.to_owned();
                Some(Rodata::Str(interns.intern(&s)))
            } else if let Some(b) = value.as_bytes(heap, interns) {
                let b = b.to_owned();
                Some(Rodata::Bytes(interns.intern_bytes(&b)))
            } else {
                None
            }
        }
        _ => None,
    };
    value.drop_with_heap(heap);
    rod
}

/// Removes contiguous `NOP` runs, shifting instructions down and adjusting
/// label targets past each run.
fn compact_nops(fr: &mut AsFrame) {
    let mut i = 0;
    while i < fr.instr.len() {
        if fr.instr[i].code != Opcode::Nop {
            i += 1;
            continue;
        }
        let after = i;
        let mut end = i;
        while end < fr.instr.len() && fr.instr[end].code == Opcode::Nop {
            end += 1;
        }
        let amount = (end - after) as u16;
        for label in &mut fr.labels {
            if *label > after as u16 {
                *label -= amount;
            }
        }
        fr.instr.drain(after..end);
        // Do not advance: the shifted-in instruction could be a NOP too.
    }
}

/// Replaces each `DEFFUNC` function number with the rodata index of the
/// already-built child executable.
fn link_children(fr: &mut AsFrame, built: &AHashMap<u32, Rc<Xptr>>) -> RunResult<()> {
    for i in 0..fr.instr.len() {
        if fr.instr[i].code != Opcode::DefFunc {
            continue;
        }
        let funcno = fr.instr[i].arg2.cast_unsigned() as u32;
        let Some(child) = built.get(&funcno) else {
            return Err(RunError::system(format!(
                "nested function {funcno} was not assembled before its parent"
            )));
        };
        let slot = fr.seek_or_add_const(Rodata::Xptr(Rc::clone(child)))?;
        fr.instr[i].arg2 = slot;
    }
    Ok(())
}

/// True when an instruction's arg2 addresses a rodata slot.
fn uses_rodata(ii: Instr) -> bool {
    ii.code.uses_rodata()
        || (matches!(ii.code, Opcode::PushPtr | Opcode::PushCopy) && ii.arg1 == iarg::PTR_SEEK)
        || (matches!(ii.code, Opcode::GetAttr | Opcode::SetAttr) && ii.arg1 == iarg::ATTR_CONST)
}

/// Drops rodata slots no instruction references (folding orphans them),
/// shifting the survivors down and patching referring instructions.
/// Child executables are always kept: the ownership edge matters even
/// while a `DEFFUNC` is unreachable.
fn compact_rodata(fr: &mut AsFrame) {
    let mut used = vec![false; fr.rodata.len()];
    for ii in &fr.instr {
        if uses_rodata(*ii) {
            used[ii.arg2.cast_unsigned() as usize] = true;
        }
    }
    for (slot, rod) in fr.rodata.iter().enumerate() {
        if matches!(rod, Rodata::Xptr(_)) {
            used[slot] = true;
        }
    }

    let mut remap = vec![0i16; fr.rodata.len()];
    let mut next = 0i16;
    for (slot, &keep) in used.iter().enumerate() {
        if keep {
            remap[slot] = next;
            next += 1;
        }
    }
    if next as usize == fr.rodata.len() {
        return;
    }

    let old = std::mem::take(&mut fr.rodata);
    fr.rodata = old
        .into_iter()
        .zip(used.iter())
        .filter_map(|(rod, &keep)| keep.then_some(rod))
        .collect();
    for ii in &mut fr.instr {
        if uses_rodata(*ii) {
            ii.arg2 = remap[ii.arg2.cast_unsigned() as usize];
        }
    }
}

/// Converts label-table indices into pc-relative branch offsets
/// (target − current − 1, since the pc has advanced by fetch time).
fn resolve_labels(fr: &mut AsFrame) -> RunResult<()> {
    for i in 0..fr.instr.len() {
        let ii = fr.instr[i];
        if !ii.code.uses_label() {
            continue;
        }
        if ii.code == Opcode::PushBlock && ii.arg1 == iarg::BLOCK {
            continue;
        }
        let label_idx = ii.arg2.cast_unsigned() as usize;
        let target = i32::from(fr.labels[label_idx]);
        let offset = target - i as i32 - 1;
        fr.instr[i].arg2 = i16::try_from(offset)
            .map_err(|_| RunError::parser("branch offset exceeds 16 bits; function too large"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(instr: Vec<Instr>, rodata: Vec<Rodata>, labels: Vec<u16>) -> AsFrame {
        let mut fr = AsFrame::new(0, 1);
        fr.instr = instr;
        fr.rodata = rodata;
        fr.labels = labels;
        fr
    }

    #[test]
    fn folds_nested_arithmetic_to_one_const() {
        // 2 + 3 * 4: push 2, push 3, push 4, mul, add
        let mut fr = frame_with(
            vec![
                Instr::new(Opcode::PushConst, 0, 0),
                Instr::new(Opcode::PushConst, 0, 1),
                Instr::new(Opcode::PushConst, 0, 2),
                Instr::new(Opcode::Mul, 0, 0),
                Instr::new(Opcode::Add, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ],
            vec![Rodata::Int(2), Rodata::Int(3), Rodata::Int(4)],
            vec![],
        );
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        fold_constants(&mut fr, &mut heap, &mut interns).unwrap();
        compact_rodata(&mut fr);

        assert_eq!(fr.instr.len(), 2);
        assert_eq!(fr.instr[0].code, Opcode::PushConst);
        assert!(matches!(fr.rodata[fr.instr[0].arg2 as usize], Rodata::Int(14)));
        assert_eq!(fr.instr[1].code, Opcode::End);
        assert_eq!(fr.rodata.len(), 1);
    }

    #[test]
    fn fold_error_is_discarded() {
        // 1 / 0 stays unfolded; runtime decides.
        let mut fr = frame_with(
            vec![
                Instr::new(Opcode::PushConst, 0, 0),
                Instr::new(Opcode::PushConst, 0, 1),
                Instr::new(Opcode::Div, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ],
            vec![Rodata::Int(1), Rodata::Int(0)],
            vec![],
        );
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        fold_constants(&mut fr, &mut heap, &mut interns).unwrap();
        assert_eq!(fr.instr.len(), 4);
    }

    #[test]
    fn nop_compaction_shifts_labels() {
        let mut fr = frame_with(
            vec![
                Instr::new(Opcode::PushConst, 0, 0),
                Instr::new(Opcode::Nop, 0, 0),
                Instr::new(Opcode::Nop, 0, 0),
                Instr::new(Opcode::Pop, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ],
            vec![Rodata::Int(1)],
            vec![0, 3, 4],
        );
        compact_nops(&mut fr);
        assert_eq!(fr.instr.len(), 3);
        assert_eq!(&*fr.labels, &[0, 1, 2]);
        assert_eq!(fr.instr[1].code, Opcode::Pop);
    }

    #[test]
    fn label_resolution_is_pc_relative() {
        let mut fr = frame_with(
            vec![
                Instr::new(Opcode::B, 0, 0),
                Instr::new(Opcode::Pop, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ],
            vec![],
            vec![2],
        );
        resolve_labels(&mut fr).unwrap();
        // From instruction 0 to target 2: offset 1.
        assert_eq!(fr.instr[0].arg2, 1);
    }

    #[test]
    fn folding_strings_concatenates() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        let mut fr = frame_with(
            vec![
                Instr::new(Opcode::PushConst, 0, 0),
                Instr::new(Opcode::PushConst, 0, 1),
                Instr::new(Opcode::Add, 0, 0),
                Instr::new(Opcode::End, 0, 0),
            ],
            vec![Rodata::Str(a), Rodata::Str(b)],
            vec![],
        );
        fold_constants(&mut fr, &mut heap, &mut interns).unwrap();
        assert_eq!(fr.instr.len(), 2);
        let Rodata::Str(id) = fr.rodata[fr.instr[0].arg2 as usize] else {
            panic!("expected folded string");
        };
        assert_eq!(interns.get_str(id), "foobar");
        // The temporary concat result must not leak.
        assert_eq!(heap.live_count(), 0);
    }
}
