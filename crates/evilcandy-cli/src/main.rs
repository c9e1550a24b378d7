//! The evilcandy driver.
//!
//! ```text
//! evilcandy [-d|--disassemble] [-c OUT] [-r] FILE|-
//! ```
//!
//! `-d` prints a disassembly listing instead of executing; `-c OUT` writes
//! the compiled byte code to OUT; `-r` treats the input as a byte-code
//! file instead of source. Exit codes: 0 on clean termination, 1 on an
//! unhandled exception or parse error, 2 on command-line misuse.

use std::{
    env, fs,
    io::Read,
    process::ExitCode,
    rc::Rc,
};

use evilcandy::{Instr, Interp, Interns, Opcode, Rodata, Xptr, iarg, quote_bytes};

struct Options {
    disassemble: bool,
    write_bytecode: Option<String>,
    read_bytecode: bool,
    input: String,
}

fn usage() -> ExitCode {
    eprintln!("usage: evilcandy [-d|--disassemble] [-c OUT] [-r] FILE|-");
    ExitCode::from(2)
}

fn parse_args(args: &[String]) -> Result<Options, ()> {
    let mut opts = Options {
        disassemble: false,
        write_bytecode: None,
        read_bytecode: false,
        input: String::new(),
    };
    let mut it = args.iter();
    let mut input = None;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-d" | "--disassemble" => opts.disassemble = true,
            "-c" => {
                let Some(out) = it.next() else {
                    return Err(());
                };
                opts.write_bytecode = Some(out.clone());
            }
            "-r" => opts.read_bytecode = true,
            "-" => {
                if input.replace("-".to_owned()).is_some() {
                    return Err(());
                }
            }
            other if other.starts_with('-') => return Err(()),
            other => {
                if input.replace(other.to_owned()).is_some() {
                    return Err(());
                }
            }
        }
    }
    opts.input = input.ok_or(())?;
    Ok(opts)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Ok(opts) = parse_args(&args) else {
        return usage();
    };

    let mut interp = Interp::new();

    let xptr = if opts.read_bytecode {
        let data = match read_input_bytes(&opts.input) {
            Ok(d) => d,
            Err(err) => {
                eprintln!("evilcandy: {err}");
                return ExitCode::FAILURE;
            }
        };
        match interp.deserialize(&data) {
            Ok(x) => x,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let (src, name) = match read_input_text(&opts.input) {
            Ok(pair) => pair,
            Err(err) => {
                eprintln!("evilcandy: {err}");
                return ExitCode::FAILURE;
            }
        };
        match interp.compile(&src, &name) {
            Ok(x) => x,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
    };

    if let Some(out) = &opts.write_bytecode {
        let bytes = interp.serialize(&xptr);
        if let Err(err) = fs::write(out, bytes) {
            eprintln!("evilcandy: write {out}: {err}");
            return ExitCode::FAILURE;
        }
    }

    if opts.disassemble {
        print!("{}", disassemble(&xptr, interp.interns()));
        return ExitCode::SUCCESS;
    }

    match interp.execute(&xptr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_input_text(path: &str) -> Result<(String, String), String> {
    if path == "-" {
        let mut src = String::new();
        std::io::stdin()
            .read_to_string(&mut src)
            .map_err(|e| format!("stdin: {e}"))?;
        return Ok((src, "<stdin>".to_owned()));
    }
    let src = fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    Ok((src, path.to_owned()))
}

fn read_input_bytes(path: &str) -> Result<Vec<u8>, String> {
    if path == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .map_err(|e| format!("stdin: {e}"))?;
        return Ok(data);
    }
    fs::read(path).map_err(|e| format!("{path}: {e}"))
}

/// Renders the listing form the reassembler reads back.
fn disassemble(entry: &Rc<Xptr>, interns: &Interns) -> String {
    let mut out = String::new();
    out.push_str(&format!(".evilcandy {}\n", entry.file_name));
    for xptr in entry.collect_tree() {
        out.push('\n');
        out.push_str(&format!(".start {} {}\n", xptr.uuid, xptr.file_line));
        for rod in &xptr.rodata {
            match rod {
                Rodata::Empty => out.push_str(".rodata empty\n"),
                Rodata::Int(v) => out.push_str(&format!(".rodata int {v}\n")),
                Rodata::Float(v) => {
                    let mut buf = ryu_format(*v);
                    buf.insert_str(0, ".rodata float ");
                    buf.push('\n');
                    out.push_str(&buf);
                }
                Rodata::Str(id) => {
                    out.push_str(&format!(".rodata string {}\n", quote_bytes(interns.get_str(*id).as_bytes())));
                }
                Rodata::Bytes(id) => {
                    out.push_str(&format!(".rodata bytes {}\n", quote_bytes(interns.get_bytes(*id))));
                }
                Rodata::Xptr(child) => out.push_str(&format!(".rodata xptr {}\n", child.uuid)),
            }
        }
        for label in &xptr.labels {
            out.push_str(&format!(".label {label}\n"));
        }
        for ii in &xptr.instr {
            out.push_str(&format_instr(*ii));
        }
        out.push_str(".end\n");
    }
    out
}

fn ryu_format(v: f64) -> String {
    let mut buf = ryu::Buffer::new();
    buf.format(v).to_owned()
}

fn format_instr(ii: Instr) -> String {
    let note = instr_note(ii);
    if note.is_empty() {
        format!("{} {} {}\n", ii.code.mnemonic(), ii.arg1, ii.arg2)
    } else {
        format!("{} {} {}\t; {note}\n", ii.code.mnemonic(), ii.arg1, ii.arg2)
    }
}

/// A short human hint for sub-moded instructions.
fn instr_note(ii: Instr) -> &'static str {
    match (ii.code, ii.arg1) {
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_AP) => "local",
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_FP) => "arg",
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_CP) => "closure",
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_SEEK) => "seek",
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_GBL) => "global-object",
        (Opcode::PushPtr | Opcode::PushCopy, iarg::PTR_THIS) => "this",
        (Opcode::Cmp, iarg::EQ) => "eq",
        (Opcode::Cmp, iarg::LEQ) => "leq",
        (Opcode::Cmp, iarg::GEQ) => "geq",
        (Opcode::Cmp, iarg::NEQ) => "neq",
        (Opcode::Cmp, iarg::LT) => "lt",
        (Opcode::Cmp, iarg::GT) => "gt",
        (Opcode::CallFunc, iarg::WITH_PARENT) => "with-parent",
        _ => "",
    }
}
