//! Byte-code representation: fixed 32-bit instructions and their opcodes.
//!
//! Every instruction packs to exactly four bytes — opcode (8 bits),
//! `arg1` (8 bits, usually a sub-mode from [`iarg`]), and `arg2` (signed
//! 16 bits, usually a rodata index or a pc-relative offset). The packing is
//! what the serializer writes, so [`Instr::to_be_u32`]/[`Instr::from_be_u32`]
//! are the single source of truth for the wire layout.

use strum::{EnumString, FromRepr, IntoStaticStr};

use crate::exc::{RunError, RunResult};

/// The instruction set.
///
/// Discriminants are the on-disk opcode bytes; once byte-code files exist
/// in the wild, new opcodes go at the end.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    Nop = 0,

    // Stack
    PushConst,
    /// Pushes null, creating a local slot above the arguments.
    PushLocal,
    /// Pushes a slot reference; arg1 selects the mode (see [`iarg`]).
    PushPtr,
    /// Pushes a dereferenced copy of the slot arg1/arg2 name.
    PushCopy,
    /// Pushes integer zero (for-loop init shorthand).
    PushZero,
    Pop,
    /// Pops a local slot at scope exit.
    PopLocal,
    /// Saves TOS, pops arg2 values, re-pushes the saved value. Collapses
    /// the parent chain accumulated by attribute dereferences.
    Unwind,

    // Definition
    /// Materializes a function value from the child xptr at rodata[arg2].
    DefFunc,
    /// Pops a captured value and binds it to the function at TOS as a
    /// closure cell.
    AddClosure,
    /// Pops a value and binds it as default for argument arg2 of the
    /// function at TOS.
    AddDefault,
    DefList,
    /// Pops element and list, appends, re-pushes the list.
    ListAppend,
    DefDict,
    /// Pops value and dict, inserts under the name at rodata[arg2],
    /// re-pushes the dict. arg1 carries per-entry const/private flags.
    AddAttr,

    // Assignment: pop value and slot reference, store through the slot.
    Assign,
    AssignAdd,
    AssignSub,
    AssignMul,
    AssignDiv,
    AssignMod,
    AssignXor,
    AssignLs,
    AssignRs,
    AssignOr,
    AssignAnd,

    // Attribute
    /// Pops object (and key when arg1 is `ATTR_STACK`), pushes the object
    /// back and the attribute value above it.
    GetAttr,
    /// Pops value, optional key, and object; stores the attribute.
    SetAttr,

    // Arithmetic / logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Negate,
    BitwiseNot,
    LogicalNot,
    Lshift,
    Rshift,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    LogicalOr,
    LogicalAnd,
    Incr,
    Decr,

    /// Comparison; arg1 selects the relation (see [`iarg`]).
    Cmp,

    // Control
    /// Unconditional pc-relative branch by arg2.
    B,
    /// Branch by arg2 when truthiness of TOS equals arg1.
    BIf,
    /// Pushes a block-stack entry; loop blocks carry a pc-relative break
    /// target in arg2, plain scope markers (arg1 = `BLOCK`) do not.
    PushBlock,
    PopBlock,
    /// Stack holds `[seq, counter]`: pushes `seq[counter]` and increments
    /// the counter, or branches by arg2 when the sequence is exhausted.
    ForeachIter,

    // Calls
    /// arg2 = argument count; arg1 says whether a receiver sits beneath
    /// the callee.
    CallFunc,
    ReturnValue,

    /// Adds a global binding named by rodata[arg2].
    Symtab,
    /// Compiles and runs another source file (top level and `if` bodies).
    Load,
    /// Terminates the entry-point script cleanly.
    End,
}

impl Opcode {
    /// Decodes an opcode byte, failing with `SystemError` on garbage.
    ///
    /// Used by the deserializer; in-memory instructions are constructed
    /// typed and never need this.
    pub fn decode(byte: u8) -> RunResult<Self> {
        Self::from_repr(byte).ok_or_else(|| RunError::system(format!("invalid opcode byte {byte:#04x}")))
    }

    /// The disassembly mnemonic, also accepted by the reassembler.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// True for operators the constant folder may evaluate at assembly
    /// time. Shifts, short-circuit logic, and comparisons are excluded on
    /// purpose: their folding is deferred until a dedicated compare-const
    /// instruction exists.
    #[must_use]
    pub fn is_foldable_binop(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Mod
                | Self::Pow
                | Self::BinaryAnd
                | Self::BinaryOr
                | Self::BinaryXor
        )
    }

    /// True when arg2 is a rodata index (the rodata compactor must patch
    /// these when slots shift).
    #[must_use]
    pub fn uses_rodata(self) -> bool {
        matches!(
            self,
            Self::PushConst | Self::Symtab | Self::DefFunc | Self::Load | Self::AddAttr
        )
    }

    /// True when arg2 is a label index before the post-pass resolves it to
    /// a pc-relative offset.
    #[must_use]
    pub fn uses_label(self) -> bool {
        matches!(self, Self::B | Self::BIf | Self::ForeachIter | Self::PushBlock)
    }
}

/// `arg1` sub-mode constants, grouped per opcode family.
pub mod iarg {
    // GETATTR / SETATTR
    /// Attribute name comes from rodata[arg2].
    pub const ATTR_CONST: u8 = 0;
    /// Attribute key is popped from the stack.
    pub const ATTR_STACK: u8 = 1;

    // PUSH_PTR / PUSH_COPY
    /// Local slot, arg2 relative to the argument pointer.
    pub const PTR_AP: u8 = 0;
    /// Argument slot, arg2 relative to the frame base.
    pub const PTR_FP: u8 = 1;
    /// Closure cell index.
    pub const PTR_CP: u8 = 2;
    /// Deferred global lookup; arg2 names the symbol in rodata.
    pub const PTR_SEEK: u8 = 3;
    /// The globals object itself; arg2 ignored.
    pub const PTR_GBL: u8 = 4;
    /// The owning object; arg2 ignored.
    pub const PTR_THIS: u8 = 5;

    // CALL_FUNC
    pub const NO_PARENT: u8 = 0;
    pub const WITH_PARENT: u8 = 1;

    // CMP
    pub const EQ: u8 = 0;
    pub const LEQ: u8 = 1;
    pub const GEQ: u8 = 2;
    pub const NEQ: u8 = 3;
    pub const LT: u8 = 4;
    pub const GT: u8 = 5;

    // ASSIGN
    /// First store through this slot locks the binding.
    pub const FLAG_CONST: u8 = 1;

    // ADDATTR flag bits
    pub const ATTR_FLAG_CONST: u8 = 1;
    pub const ATTR_FLAG_PRIVATE: u8 = 2;

    // PUSH_BLOCK
    /// Loop block; arg2 is the break target.
    pub const LOOP: u8 = 0;
    /// Lexical scope marker; arg2 unused and exempt from label resolution.
    pub const BLOCK: u8 = 1;
}

/// One fixed-width instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub code: Opcode,
    pub arg1: u8,
    pub arg2: i16,
}

impl Instr {
    #[must_use]
    pub fn new(code: Opcode, arg1: u8, arg2: i16) -> Self {
        Self { code, arg1, arg2 }
    }

    /// Packs to the serialized big-endian word: code, arg1, arg2.
    #[must_use]
    pub fn to_be_u32(self) -> u32 {
        (u32::from(self.code as u8) << 24) | (u32::from(self.arg1) << 16) | u32::from(self.arg2.cast_unsigned())
    }

    /// Unpacks a serialized word, validating the opcode byte.
    pub fn from_be_u32(word: u32) -> RunResult<Self> {
        let code = Opcode::decode((word >> 24) as u8)?;
        let arg1 = ((word >> 16) & 0xff) as u8;
        let arg2 = ((word & 0xffff) as u16).cast_signed();
        Ok(Self { code, arg1, arg2 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let cases = [
            Instr::new(Opcode::Nop, 0, 0),
            Instr::new(Opcode::PushConst, 0, 17),
            Instr::new(Opcode::B, 0, -5),
            Instr::new(Opcode::PushPtr, iarg::PTR_SEEK, 3),
            Instr::new(Opcode::End, 0xff, i16::MIN),
        ];
        for ii in cases {
            let word = ii.to_be_u32();
            assert_eq!(Instr::from_be_u32(word).unwrap(), ii);
        }
    }

    #[test]
    fn big_endian_layout() {
        let ii = Instr::new(Opcode::PushConst, 2, 0x0102);
        let word = ii.to_be_u32();
        assert_eq!(word.to_be_bytes(), [Opcode::PushConst as u8, 2, 0x01, 0x02]);
    }

    #[test]
    fn bad_opcode_byte_rejected() {
        assert!(Instr::from_be_u32(0xff00_0000).is_err());
    }

    #[test]
    fn mnemonics_round_trip() {
        assert_eq!(Opcode::PushConst.mnemonic(), "push_const");
        assert_eq!("foreach_iter".parse::<Opcode>().unwrap(), Opcode::ForeachIter);
    }
}
