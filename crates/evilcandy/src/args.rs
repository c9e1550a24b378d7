//! Argument unpacking for built-in functions.
//!
//! Built-ins declare their expected arguments with a compact format string;
//! the unpacker validates count and types, destructures sequences and
//! dicts, and produces typed values. Mismatches raise `TypeError` naming
//! the builtin and the offending position.
//!
//! Format characters:
//!
//! - `b h i l` — integers of increasing width (8/16/32/64 bit, range
//!   checked)
//! - `f` — a double (int promotes)
//! - `s` — a string, copied out
//! - `c` — a single-codepoint string, yielding the codepoint
//! - `.` — accept and skip one argument
//! - `|` — end of mandatory arguments
//! - `<…>` — a typed object reference; letters inside name the accepted
//!   types (`s` string, `c` char, `i` int, `f` float, `b` bytes, `z`
//!   complex, `x` function, `r` range, `/` file, `*` anything) and the
//!   bracket pairs `{}` `[]` `()` accept dict/list/tuple
//! - `[…]` `(…)` — destructure a list/tuple element-wise
//! - `{key:F, …}` — destructure a dict by named keys
//! - `:name` — trailing reporting name for error messages

use crate::{
    exc::{RunError, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    types::Type,
    value::Value,
};

/// One extracted argument.
#[derive(Debug)]
pub(crate) enum Unpacked {
    Int(i64),
    Double(f64),
    Str(String),
    Char(char),
    /// Owned reference; the caller releases it.
    Obj(Value),
    Skipped,
    /// An optional argument that was not supplied.
    Absent,
}

impl Unpacked {
    pub(crate) fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Obj(v) = self {
            v.drop_with_heap(heap);
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    IntScalar(IntWidth),
    Double,
    StrView,
    Char,
    Skip,
    Obj(TypeSet),
    Seq(SeqKind, Vec<Item>),
    DictKeys(Vec<(String, Item)>),
}

#[derive(Debug, Clone, Copy)]
enum IntWidth {
    Byte,
    Short,
    Int,
    Long,
}

#[derive(Debug, Clone, Copy)]
enum SeqKind {
    List,
    Tuple,
}

#[derive(Debug, Clone, Copy, Default)]
struct TypeSet {
    string: bool,
    char_str: bool,
    int: bool,
    float: bool,
    bytes: bool,
    complex: bool,
    function: bool,
    range: bool,
    file: bool,
    dict: bool,
    list: bool,
    tuple: bool,
    any: bool,
}

#[derive(Debug)]
struct FormatSpec {
    items: Vec<Item>,
    /// Item index where optional arguments begin.
    opt_start: usize,
    name: String,
}

/// Unpacks `args` according to `fmt`. See the module docs for the format
/// grammar. On error, no extracted references leak.
pub(crate) fn unpack_args(
    fmt: &str,
    args: &[Value],
    heap: &mut Heap,
    interns: &Interns,
) -> RunResult<Vec<Unpacked>> {
    let spec = parse_format(fmt)?;
    let mut out = Vec::with_capacity(spec.items.len());
    match unpack_into(&spec, args, heap, interns, &mut out) {
        Ok(()) => Ok(out),
        Err(e) => {
            for u in out {
                u.drop_with_heap(heap);
            }
            Err(e)
        }
    }
}

fn unpack_into(
    spec: &FormatSpec,
    args: &[Value],
    heap: &mut Heap,
    interns: &Interns,
    out: &mut Vec<Unpacked>,
) -> RunResult<()> {
    let mut pos = 0usize;
    for (idx, item) in spec.items.iter().enumerate() {
        if pos >= args.len() {
            if idx >= spec.opt_start {
                for _ in idx..spec.items.len() {
                    out.push(Unpacked::Absent);
                }
                return Ok(());
            }
            return Err(RunError::type_error(format!(
                "{}: expected at least {} argument(s), got {}",
                spec.name, spec.opt_start, args.len()
            )));
        }
        convert(item, &args[pos], pos, &spec.name, heap, interns, out)?;
        pos += 1;
    }
    if pos < args.len() {
        return Err(RunError::type_error(format!(
            "{}: expected at most {} argument(s), got {}",
            spec.name,
            spec.items.len(),
            args.len()
        )));
    }
    Ok(())
}

fn convert(
    item: &Item,
    arg: &Value,
    pos: usize,
    name: &str,
    heap: &mut Heap,
    interns: &Interns,
    out: &mut Vec<Unpacked>,
) -> RunResult<()> {
    match item {
        Item::IntScalar(width) => {
            let Value::Int(v) = arg else {
                return Err(mismatch(name, pos, "integer", arg, heap));
            };
            let fits = match width {
                IntWidth::Byte => i8::try_from(*v).is_ok(),
                IntWidth::Short => i16::try_from(*v).is_ok(),
                IntWidth::Int => i32::try_from(*v).is_ok(),
                IntWidth::Long => true,
            };
            if !fits {
                return Err(RunError::value_error(format!(
                    "{name}: argument {} out of range",
                    pos + 1
                )));
            }
            out.push(Unpacked::Int(*v));
        }
        Item::Double => match arg {
            Value::Int(v) => out.push(Unpacked::Double(*v as f64)),
            Value::Float(v) => out.push(Unpacked::Double(*v)),
            _ => return Err(mismatch(name, pos, "number", arg, heap)),
        },
        Item::StrView => {
            let Some(s) = arg.as_str(heap, interns) else {
                return Err(mismatch(name, pos, "string", arg, heap));
            };
            let s = s.to_owned();
            out.push(Unpacked::Str(s));
        }
        Item::Char => {
            let Some(s) = arg.as_str(heap, interns) else {
                return Err(mismatch(name, pos, "string", arg, heap));
            };
            let mut chars = s.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                return Err(mismatch(name, pos, "single-character string", arg, heap));
            };
            out.push(Unpacked::Char(c));
        }
        Item::Skip => out.push(Unpacked::Skipped),
        Item::Obj(set) => {
            if !type_matches(set, arg, heap, interns) {
                return Err(mismatch(name, pos, "object of the accepted types", arg, heap));
            }
            out.push(Unpacked::Obj(arg.clone_with_heap(heap)));
        }
        Item::Seq(kind, inner) => {
            let (want, len) = match (kind, arg) {
                (SeqKind::List, Value::Ref(id)) => match heap.get(*id) {
                    HeapData::List(l) => ("list", Some(l.len())),
                    _ => ("list", None),
                },
                (SeqKind::Tuple, Value::Ref(id)) => match heap.get(*id) {
                    HeapData::Tuple(t) => ("tuple", Some(t.len())),
                    _ => ("tuple", None),
                },
                (SeqKind::List, _) => ("list", None),
                (SeqKind::Tuple, _) => ("tuple", None),
            };
            let Some(len) = len else {
                return Err(mismatch(name, pos, want, arg, heap));
            };
            if len != inner.len() {
                return Err(RunError::type_error(format!(
                    "{name}: argument {} expected {} element(s), got {len}",
                    pos + 1,
                    inner.len()
                )));
            }
            let Value::Ref(id) = arg else {
                unreachable!("sequence checked above");
            };
            for (k, sub) in inner.iter().enumerate() {
                let elem = match heap.get(*id) {
                    HeapData::List(l) => l.items()[k].clone_with_heap(heap),
                    HeapData::Tuple(t) => t.items()[k].clone_with_heap(heap),
                    _ => unreachable!("sequence checked above"),
                };
                let res = convert(sub, &elem, pos, name, heap, interns, out);
                elem.drop_with_heap(heap);
                res?;
            }
        }
        Item::DictKeys(keys) => {
            let is_dict = matches!(arg, Value::Ref(id) if matches!(heap.get(*id), HeapData::Dict(_)));
            if !is_dict {
                return Err(mismatch(name, pos, "dict", arg, heap));
            }
            let Value::Ref(id) = arg else {
                unreachable!("dict checked above");
            };
            for (key, sub) in keys {
                let value = {
                    let HeapData::Dict(dict) = heap.get(*id) else {
                        unreachable!("dict checked above");
                    };
                    let Some(entry) = dict.get(key) else {
                        return Err(RunError::type_error(format!(
                            "{name}: argument {} missing key '{key}'",
                            pos + 1
                        )));
                    };
                    entry.value.clone_with_heap(heap)
                };
                let res = convert(sub, &value, pos, name, heap, interns, out);
                value.drop_with_heap(heap);
                res?;
            }
        }
    }
    Ok(())
}

fn mismatch(name: &str, pos: usize, want: &str, arg: &Value, heap: &Heap) -> RunError {
    RunError::type_error(format!(
        "{name}: argument {} expected {want}, got {}",
        pos + 1,
        arg.type_of(heap).name()
    ))
}

fn type_matches(set: &TypeSet, arg: &Value, heap: &Heap, interns: &Interns) -> bool {
    if set.any {
        return true;
    }
    match arg.type_of(heap) {
        Type::String => {
            if set.string {
                return true;
            }
            set.char_str && arg.as_str(heap, interns).is_some_and(|s| s.chars().count() == 1)
        }
        Type::Int => set.int,
        Type::Float => set.float,
        Type::Bytes => set.bytes,
        Type::Complex => set.complex,
        Type::Function | Type::Method => set.function,
        Type::Range => set.range,
        Type::File => set.file,
        Type::Dict => set.dict,
        Type::List => set.list,
        Type::Tuple => set.tuple,
        _ => false,
    }
}

fn parse_format(fmt: &str) -> RunResult<FormatSpec> {
    let mut chars: Vec<char> = fmt.chars().collect();
    let mut name = "builtin".to_owned();
    // The reporting name is introduced by a colon at nesting depth zero;
    // colons inside `{key:F}` destructuring don't count.
    let mut depth = 0i32;
    let mut name_at = None;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' | '[' | '(' | '<' => depth += 1,
            '}' | ']' | ')' | '>' => depth -= 1,
            ':' if depth == 0 => {
                name_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    if let Some(colon) = name_at {
        name = chars[colon + 1..].iter().collect();
        chars.truncate(colon);
    }

    let mut items = Vec::new();
    let mut opt_start = None;
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '|' {
            opt_start = Some(items.len());
            i += 1;
            continue;
        }
        let (item, next) = parse_item(&chars, i, &name)?;
        items.push(item);
        i = next;
    }
    Ok(FormatSpec {
        opt_start: opt_start.unwrap_or(items.len()),
        items,
        name,
    })
}

/// Parses one item starting at `i`, returning it and the index just past
/// it.
fn parse_item(chars: &[char], i: usize, name: &str) -> RunResult<(Item, usize)> {
    let bad = |c: char| RunError::system(format!("{name}: bad format character '{c}'"));
    match chars[i] {
        'b' => Ok((Item::IntScalar(IntWidth::Byte), i + 1)),
        'h' => Ok((Item::IntScalar(IntWidth::Short), i + 1)),
        'i' => Ok((Item::IntScalar(IntWidth::Int), i + 1)),
        'l' => Ok((Item::IntScalar(IntWidth::Long), i + 1)),
        'f' => Ok((Item::Double, i + 1)),
        's' => Ok((Item::StrView, i + 1)),
        'c' => Ok((Item::Char, i + 1)),
        '.' => Ok((Item::Skip, i + 1)),
        '<' => {
            let mut set = TypeSet::default();
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '>' {
                match chars[j] {
                    's' => set.string = true,
                    'c' => set.char_str = true,
                    'i' => set.int = true,
                    'f' => set.float = true,
                    'b' => set.bytes = true,
                    'z' => set.complex = true,
                    'x' => set.function = true,
                    'r' => set.range = true,
                    '/' => set.file = true,
                    '*' => set.any = true,
                    '{' | '}' => set.dict = true,
                    '[' | ']' => set.list = true,
                    '(' | ')' => set.tuple = true,
                    c => return Err(bad(c)),
                }
                j += 1;
            }
            if j >= chars.len() {
                return Err(RunError::system(format!("{name}: unterminated '<' in format")));
            }
            Ok((Item::Obj(set), j + 1))
        }
        open @ ('[' | '(') => {
            let close = if open == '[' { ']' } else { ')' };
            let kind = if open == '[' { SeqKind::List } else { SeqKind::Tuple };
            let mut inner = Vec::new();
            let mut j = i + 1;
            while j < chars.len() && chars[j] != close {
                let (item, next) = parse_item(chars, j, name)?;
                inner.push(item);
                j = next;
            }
            if j >= chars.len() {
                return Err(RunError::system(format!("{name}: unterminated '{open}' in format")));
            }
            Ok((Item::Seq(kind, inner), j + 1))
        }
        '{' => {
            let mut keys = Vec::new();
            let mut j = i + 1;
            loop {
                if j < chars.len() && chars[j] == '}' {
                    j += 1;
                    break;
                }
                let mut key = String::new();
                while j < chars.len() && chars[j] != ':' {
                    key.push(chars[j]);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(RunError::system(format!("{name}: unterminated '{{' in format")));
                }
                j += 1; // past ':'
                if j >= chars.len() {
                    return Err(RunError::system(format!("{name}: unterminated '{{' in format")));
                }
                let (item, next) = parse_item(chars, j, name)?;
                keys.push((key.trim().to_owned(), item));
                j = next;
                if j < chars.len() && chars[j] == ',' {
                    j += 1;
                }
            }
            Ok((Item::DictKeys(keys), j))
        }
        c => Err(bad(c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dict, List};

    fn env() -> (Heap, Interns) {
        (Heap::new(), Interns::new())
    }

    #[test]
    fn scalars_and_optionals() {
        let (mut heap, interns) = env();
        let got = unpack_args("l|l:range", &[Value::Int(5)], &mut heap, &interns).unwrap();
        assert!(matches!(got[0], Unpacked::Int(5)));
        assert!(matches!(got[1], Unpacked::Absent));

        let err = unpack_args("l:range", &[], &mut heap, &interns).unwrap_err();
        assert!(err.message().contains("range"));
    }

    #[test]
    fn int_width_checked() {
        let (mut heap, interns) = env();
        assert!(unpack_args("b:f", &[Value::Int(127)], &mut heap, &interns).is_ok());
        assert!(unpack_args("b:f", &[Value::Int(128)], &mut heap, &interns).is_err());
        assert!(unpack_args("h:f", &[Value::Int(40_000)], &mut heap, &interns).is_err());
    }

    #[test]
    fn string_and_char() {
        let (mut heap, mut interns) = env();
        let s = Value::Str(interns.intern("é"));
        let got = unpack_args("c:f", &[s], &mut heap, &interns).unwrap();
        assert!(matches!(got[0], Unpacked::Char('é')));

        let s = Value::Str(interns.intern("no"));
        assert!(unpack_args("c:f", &[s], &mut heap, &interns).is_err());
    }

    #[test]
    fn float_promotes_int() {
        let (mut heap, interns) = env();
        let got = unpack_args("f:f", &[Value::Int(3)], &mut heap, &interns).unwrap();
        assert!(matches!(got[0], Unpacked::Double(v) if v == 3.0));
    }

    #[test]
    fn typed_object_sets() {
        let (mut heap, mut interns) = env();
        let list = Value::Ref(heap.allocate(HeapData::List(List::new())));
        let got = unpack_args("<[]s>:f", std::slice::from_ref(&list), &mut heap, &interns).unwrap();
        assert!(matches!(&got[0], Unpacked::Obj(Value::Ref(_))));

        let s = Value::Str(interns.intern("x"));
        assert!(unpack_args("<[]>:f", &[s], &mut heap, &interns).is_err());

        for g in got {
            g.drop_with_heap(&mut heap);
        }
        list.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn seq_destructure() {
        let (mut heap, interns) = env();
        let pair = Value::Ref(heap.allocate(HeapData::List(List::from_items(vec![
            Value::Int(3),
            Value::Float(0.5),
        ]))));
        let got = unpack_args("[lf]:f", std::slice::from_ref(&pair), &mut heap, &interns).unwrap();
        assert!(matches!(got[0], Unpacked::Int(3)));
        assert!(matches!(got[1], Unpacked::Double(v) if v == 0.5));
        pair.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn dict_destructure() {
        let (mut heap, mut interns) = env();
        let mut d = Dict::new();
        d.insert("host", Value::Str(interns.intern("::1")), false, false);
        d.insert("port", Value::Int(8080), false, false);
        let dv = Value::Ref(heap.allocate(HeapData::Dict(d)));
        let got = unpack_args("{host:s,port:i}:connect", std::slice::from_ref(&dv), &mut heap, &interns).unwrap();
        assert!(matches!(&got[0], Unpacked::Str(s) if s == "::1"));
        assert!(matches!(got[1], Unpacked::Int(8080)));

        let err = unpack_args("{nope:i}:connect", std::slice::from_ref(&dv), &mut heap, &interns).unwrap_err();
        assert!(err.message().contains("missing key 'nope'"));
        dv.drop_with_heap(&mut heap);
    }

    #[test]
    fn too_many_args() {
        let (mut heap, interns) = env();
        let err = unpack_args("l:f", &[Value::Int(1), Value::Int(2)], &mut heap, &interns).unwrap_err();
        assert!(err.message().contains("at most"));
    }

    #[test]
    fn skip_accepts_anything() {
        let (mut heap, interns) = env();
        let got = unpack_args(".l:f", &[Value::Null, Value::Int(2)], &mut heap, &interns).unwrap();
        assert!(matches!(got[0], Unpacked::Skipped));
        assert!(matches!(got[1], Unpacked::Int(2)));
    }
}
