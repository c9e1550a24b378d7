//! The reassembler: a text-based path into the executable tree.
//!
//! Reads the terse disassembly listing format and produces the same
//! in-memory tree as deserializing a byte-code file. The grammar, one
//! directive or instruction per line (`;` starts a comment):
//!
//! ```text
//! .evilcandy <source-file-name>
//! .start <uuid> <first-line>
//! .rodata empty | int <n> | float <f> | string "…" | bytes "…" | xptr <uuid>
//! .label <instruction-index>
//! <mnemonic> <arg1> <arg2>
//! .end
//! ```
//!
//! Executables appear entry point first, exactly like the binary format,
//! and cross-reference each other by uuid. Rejections are `SyntaxError`
//! with the listing line number.

use std::rc::Rc;

use crate::{
    code::{Instr, Opcode},
    exc::{RunError, RunResult},
    intern::Interns,
    serialize::{RawRodata, RawXptr},
    xptr::{Rodata, Xptr},
};

/// Parses a disassembly listing into an executable tree.
pub fn reassemble(text: &str, interns: &mut Interns) -> RunResult<Rc<Xptr>> {
    let mut file_name: Option<String> = None;
    let mut records: Vec<RawXptr> = Vec::new();
    let mut current: Option<RawXptr> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let err = |msg: String| RunError::syntax(msg).with_location("<reassembly>", lineno as u32);

        if let Some(rest) = line.strip_prefix(".evilcandy") {
            if file_name.is_some() {
                return Err(err("duplicate .evilcandy directive".to_owned()));
            }
            file_name = Some(rest.trim().to_owned());
            continue;
        }
        if let Some(rest) = line.strip_prefix(".start") {
            if current.is_some() {
                return Err(err("nested .start".to_owned()));
            }
            let mut parts = rest.split_whitespace();
            let Some(uuid) = parts.next() else {
                return Err(err(".start needs a uuid".to_owned()));
            };
            let file_line = match parts.next() {
                Some(v) => v
                    .parse::<u32>()
                    .map_err(|_| err(format!("bad line number '{v}'")))?,
                None => 1,
            };
            current = Some(RawXptr {
                file_line,
                uuid: uuid.to_owned(),
                instr: Vec::new(),
                rodata: Vec::new(),
                labels: Vec::new(),
            });
            continue;
        }
        if line == ".end" {
            let Some(done) = current.take() else {
                return Err(err(".end without .start".to_owned()));
            };
            records.push(done);
            continue;
        }

        let Some(rec) = current.as_mut() else {
            return Err(err(format!("'{line}' outside .start/.end")));
        };

        if let Some(rest) = line.strip_prefix(".rodata") {
            rec.rodata.push(parse_rodata(rest.trim(), interns).map_err(|m| err(m))?);
            continue;
        }
        if let Some(rest) = line.strip_prefix(".label") {
            let v = rest.trim();
            let idx = v.parse::<u16>().map_err(|_| err(format!("bad label index '{v}'")))?;
            rec.labels.push(idx);
            continue;
        }

        rec.instr.push(parse_instr(line).map_err(|m| err(m))?);
    }

    if current.is_some() {
        return Err(RunError::syntax("missing .end at end of listing"));
    }
    if records.is_empty() {
        return Err(RunError::syntax("listing contains no executables"));
    }
    let file_name = file_name.unwrap_or_else(|| "<reassembled>".to_owned());
    crate::serialize::resolve_tree(records, &file_name)
}

fn strip_comment(line: &str) -> &str {
    // A ';' inside a quoted string does not start a comment.
    let mut in_string = false;
    let mut prev_backslash = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' if !prev_backslash => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
        prev_backslash = c == '\\' && !prev_backslash;
    }
    line
}

fn parse_rodata(rest: &str, interns: &mut Interns) -> Result<RawRodata, String> {
    let (kind, payload) = match rest.split_once(char::is_whitespace) {
        Some((k, p)) => (k, p.trim()),
        None => (rest, ""),
    };
    match kind {
        "empty" => Ok(RawRodata::Done(Rodata::Empty)),
        "int" => payload
            .parse::<i64>()
            .map(|v| RawRodata::Done(Rodata::Int(v)))
            .map_err(|_| format!("bad int constant '{payload}'")),
        "float" => payload
            .parse::<f64>()
            .map(|v| RawRodata::Done(Rodata::Float(v)))
            .map_err(|_| format!("bad float constant '{payload}'")),
        "string" => {
            let bytes = parse_quoted(payload)?;
            let s = String::from_utf8(bytes).map_err(|_| "string constant is not UTF-8".to_owned())?;
            Ok(RawRodata::Done(Rodata::Str(interns.intern(&s))))
        }
        "bytes" => {
            let bytes = parse_quoted(payload)?;
            Ok(RawRodata::Done(Rodata::Bytes(interns.intern_bytes(&bytes))))
        }
        "xptr" => {
            if payload.is_empty() {
                return Err("xptr constant needs a uuid".to_owned());
            }
            Ok(RawRodata::XptrRef(payload.to_owned()))
        }
        other => Err(format!("unknown rodata kind '{other}'")),
    }
}

fn parse_instr(line: &str) -> Result<Instr, String> {
    let mut parts = line.split_whitespace();
    let mnemonic = parts.next().expect("line is non-empty");
    let code: Opcode = mnemonic
        .parse()
        .map_err(|_| format!("unknown opcode '{mnemonic}'"))?;
    let arg1 = match parts.next() {
        Some(v) => v.parse::<u8>().map_err(|_| format!("bad arg1 '{v}'"))?,
        None => 0,
    };
    let arg2 = match parts.next() {
        Some(v) => v.parse::<i16>().map_err(|_| format!("bad arg2 '{v}'"))?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(format!("trailing tokens after '{mnemonic}'"));
    }
    Ok(Instr::new(code, arg1, arg2))
}

/// Decodes a double-quoted listing literal to raw bytes.
fn parse_quoted(s: &str) -> Result<Vec<u8>, String> {
    let inner = s
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| format!("expected a quoted literal, got '{s}'"))?;
    let mut out = Vec::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                match (hi, lo) {
                    (Some(h), Some(l)) => out.push((h * 16 + l) as u8),
                    _ => return Err("truncated \\x escape".to_owned()),
                }
            }
            other => return Err(format!("unknown escape '\\{}'", other.unwrap_or(' '))),
        }
    }
    Ok(out)
}

/// Encodes raw bytes as a double-quoted listing literal; the inverse of
/// [`parse_quoted`]. Used by the disassembly printer.
#[must_use]
pub fn quote_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 2);
    out.push('"');
    for &b in data {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0 => out.push_str("\\0"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(char::from(b)),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::serialize_xptr;

    const LISTING: &str = r#"
.evilcandy demo.evc
.start root 1
.rodata int 14
.rodata string "greeting"
.rodata xptr helper
push_const 0 0          ; the folded constant
def_func 0 2
pop 0 0
end 0 0
.label 0
.end

.start helper 3
push_zero 0 0
return_value 0 0
.end
"#;

    #[test]
    fn listing_round_trips_through_the_serializer() {
        let mut interns = Interns::new();
        let tree = reassemble(LISTING, &mut interns).unwrap();
        assert_eq!(tree.uuid, "root");
        assert_eq!(tree.instr.len(), 4);
        assert_eq!(tree.instr[0].code, Opcode::PushConst);
        assert_eq!(tree.labels.len(), 1);
        let Rodata::Xptr(child) = &tree.rodata[2] else {
            panic!("expected child reference");
        };
        assert_eq!(child.uuid, "helper");

        // The same tree survives the binary path.
        let bytes = serialize_xptr(&tree, &interns);
        let back = crate::serialize::deserialize_xptr(&bytes, &mut interns).unwrap();
        assert_eq!(back.uuid, "root");
        assert_eq!(back.instr, tree.instr);
    }

    #[test]
    fn unknown_opcode_is_a_syntax_error() {
        let mut interns = Interns::new();
        let err = reassemble(".start a\nfrobnicate 0 0\n.end", &mut interns).unwrap_err();
        assert_eq!(err.exc_type(), crate::exc::ExcType::SyntaxError);
        assert!(err.message().contains("frobnicate"));
    }

    #[test]
    fn dangling_xptr_reference_is_rejected() {
        let mut interns = Interns::new();
        let err = reassemble(".start a\n.rodata xptr nowhere\nend 0 0\n.end", &mut interns).unwrap_err();
        assert!(err.message().contains("unresolved"));
    }

    #[test]
    fn directives_outside_start_are_rejected() {
        let mut interns = Interns::new();
        assert!(reassemble("push_zero 0 0", &mut interns).is_err());
        assert!(reassemble(".start a\nend 0 0", &mut interns).is_err());
    }

    #[test]
    fn quoting_round_trips() {
        let data = b"a\"b\\c\n\x00\xff tail";
        let quoted = quote_bytes(data);
        assert_eq!(parse_quoted(&quoted).unwrap(), data);
    }
}
