//! Executables: the immutable compiled form of a script body or function.
//!
//! One [`Xptr`] exists per source function (and one for the script body);
//! function values share it via `Rc`. A parent executable owns its nested
//! definitions through [`Rodata::Xptr`] slots, forming a tree with the
//! script entry point at the root. Children never reference parents, so the
//! graph is acyclic by construction and plain `Rc` ownership is sound.

use std::rc::Rc;

use crate::{
    code::Instr,
    intern::{BytesId, StringId},
};

/// A constant in an executable's rodata table.
///
/// The variants are exactly the serializer's tag set: anything else an
/// expression needs is built at runtime from these.
#[derive(Debug, Clone)]
pub enum Rodata {
    /// Reads back as null.
    Empty,
    Int(i64),
    Float(f64),
    Str(StringId),
    Bytes(BytesId),
    /// A nested function body. Serialized as the child's uuid string.
    Xptr(Rc<Xptr>),
}

impl Rodata {
    /// Structural equality for rodata dedup during assembly.
    ///
    /// Floats compare by bit pattern so `0.0` and `-0.0` keep distinct
    /// slots; xptrs compare by identity.
    #[must_use]
    pub fn same_const(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Xptr(a), Self::Xptr(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The compiled body of one function or script.
///
/// Immutable once the post-pass materializes it; the VM, serializer, and
/// disassembler only ever read.
#[derive(Debug)]
pub struct Xptr {
    pub instr: Box<[Instr]>,
    pub rodata: Box<[Rodata]>,
    /// Instruction indices recorded during assembly. Unused at execution
    /// time; kept so disassembly stays readable and the serializer
    /// round-trips losslessly.
    pub labels: Box<[u16]>,
    /// Identifier unique within one byte-code file, used for serialized
    /// cross-references in place of pointers.
    pub uuid: String,
    pub file_name: String,
    /// Line in the source file where this body starts.
    pub file_line: u32,
}

impl Xptr {
    /// Walks the tree depth-first, entry point first, visiting every
    /// executable exactly once per rodata occurrence path.
    ///
    /// The serializer uses this to lay out children after their parents.
    pub fn for_each_child<'a>(self: &'a Rc<Self>, f: &mut impl FnMut(&'a Rc<Self>)) {
        for slot in &self.rodata {
            if let Rodata::Xptr(child) = slot {
                f(child);
                child.for_each_child(f);
            }
        }
    }

    /// Collects the whole tree in serialization order (self first), with
    /// shared children listed once.
    #[must_use]
    pub fn collect_tree(self: &Rc<Self>) -> Vec<Rc<Self>> {
        let mut out: Vec<Rc<Self>> = vec![Rc::clone(self)];
        self.for_each_child(&mut |child| {
            if !out.iter().any(|x| Rc::ptr_eq(x, child)) {
                out.push(Rc::clone(child));
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Opcode;

    fn leaf(uuid: &str) -> Rc<Xptr> {
        Rc::new(Xptr {
            instr: Box::new([Instr::new(Opcode::End, 0, 0)]),
            rodata: Box::new([]),
            labels: Box::new([]),
            uuid: uuid.to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 1,
        })
    }

    #[test]
    fn collect_tree_is_preorder_and_deduped() {
        let shared = leaf("c");
        let mid = Rc::new(Xptr {
            instr: Box::new([Instr::new(Opcode::End, 0, 0)]),
            rodata: Box::new([Rodata::Xptr(Rc::clone(&shared))]),
            labels: Box::new([]),
            uuid: "b".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 2,
        });
        let root = Rc::new(Xptr {
            instr: Box::new([Instr::new(Opcode::End, 0, 0)]),
            rodata: Box::new([Rodata::Xptr(Rc::clone(&mid)), Rodata::Xptr(Rc::clone(&shared))]),
            labels: Box::new([]),
            uuid: "a".to_owned(),
            file_name: "t.evc".to_owned(),
            file_line: 1,
        });
        let tree = root.collect_tree();
        let uuids: Vec<&str> = tree.iter().map(|x| x.uuid.as_str()).collect();
        assert_eq!(uuids, ["a", "b", "c"]);
    }

    #[test]
    fn rodata_const_identity() {
        assert!(Rodata::Int(3).same_const(&Rodata::Int(3)));
        assert!(!Rodata::Float(0.0).same_const(&Rodata::Float(-0.0)));
        assert!(!Rodata::Int(0).same_const(&Rodata::Empty));
    }
}
