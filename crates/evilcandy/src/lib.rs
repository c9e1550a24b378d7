//! EvilCandy: a small dynamically-typed scripting language with a bytecode
//! compiler and a register-free stack virtual machine.
//!
//! The pipeline: source text → token stream ([`lex`]) → per-function
//! assembly frames ([`assemble`]) → post-pass → a tree of immutable
//! executables rooted at the script body. The VM executes that tree
//! against a refcounted value heap; the serializer reads or writes it as
//! a checksummed byte-code file.

mod args;
mod assemble;
mod builtins;
mod code;
mod exc;
mod heap;
mod intern;
mod io;
mod lex;
mod object;
mod ops;
mod reassemble;
mod run;
mod serialize;
mod types;
mod value;
mod vm;
mod xptr;

pub use crate::{
    builtins::BuiltinFn,
    code::{Instr, Opcode, iarg},
    exc::{ExcType, RunError, RunResult},
    intern::{BytesId, Interns, StringId},
    io::{CollectStringPrint, PrintWriter, StdPrint},
    object::Object,
    reassemble::{quote_bytes, reassemble},
    run::Interp,
    serialize::{deserialize_xptr, ones_complement_sum, serialize_xptr},
    xptr::{Rodata, Xptr},
};
