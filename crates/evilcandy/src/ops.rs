//! Binary and unary operator dispatch.
//!
//! One table for both consumers: the VM's arithmetic instructions and the
//! post-pass constant folder call the same functions, which is what makes
//! "fold at assembly time" and "evaluate at run time" provably agree.

use crate::{
    code::{Opcode, iarg},
    exc::{RunError, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    types::{Complex, EcBytes, EcStr, List, Tuple, Type},
    value::Value,
};

/// Applies a binary operator. The operands are borrowed; the result is a
/// fresh value (heap results carry their own reference).
pub fn binary_op(op: Opcode, lhs: &Value, rhs: &Value, heap: &mut Heap, interns: &Interns) -> RunResult<Value> {
    match op {
        Opcode::Add => add(lhs, rhs, heap, interns),
        Opcode::Sub => arith(op, lhs, rhs, heap, i64::wrapping_sub, |a, b| a - b),
        Opcode::Mul => arith(op, lhs, rhs, heap, i64::wrapping_mul, |a, b| a * b),
        Opcode::Div => div(lhs, rhs, heap),
        Opcode::Mod => modulo(lhs, rhs, heap),
        Opcode::Pow => pow(lhs, rhs, heap),
        Opcode::Lshift => shift(lhs, rhs, heap, true),
        Opcode::Rshift => shift(lhs, rhs, heap, false),
        Opcode::BinaryAnd => bitwise(op, lhs, rhs, heap, |a, b| a & b),
        Opcode::BinaryOr => {
            if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs)
                && matches!(heap.get(*a), HeapData::Dict(_))
                && matches!(heap.get(*b), HeapData::Dict(_))
            {
                return dict_union(*a, *b, heap);
            }
            bitwise(op, lhs, rhs, heap, |a, b| a | b)
        }
        Opcode::BinaryXor => bitwise(op, lhs, rhs, heap, |a, b| a ^ b),
        Opcode::LogicalOr | Opcode::LogicalAnd => {
            let a = lhs.truthy(heap, interns);
            let b = rhs.truthy(heap, interns);
            let res = if op == Opcode::LogicalOr { a || b } else { a && b };
            Ok(Value::Int(i64::from(res)))
        }
        _ => Err(RunError::type_error(format!(
            "{} is not a binary operator",
            op.mnemonic()
        ))),
    }
}

/// Applies a unary operator in place of the popped operand.
pub fn unary_op(op: Opcode, v: &Value, heap: &Heap, interns: &Interns) -> RunResult<Value> {
    match op {
        Opcode::Negate => match v {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Complex(c) => Err(RunError::not_implemented(format!(
                    "negation of complex ({}, {})",
                    c.re, c.im
                ))),
                _ => Err(type_mismatch_unary("-", v, heap)),
            },
            _ => Err(type_mismatch_unary("-", v, heap)),
        },
        Opcode::BitwiseNot => match v {
            Value::Int(i) => Ok(Value::Int(!i)),
            _ => Err(type_mismatch_unary("~", v, heap)),
        },
        Opcode::LogicalNot => Ok(Value::Int(i64::from(!v.truthy(heap, interns)))),
        Opcode::Incr => match v {
            Value::Int(i) => Ok(Value::Int(i.wrapping_add(1))),
            Value::Float(f) => Ok(Value::Float(f + 1.0)),
            _ => Err(type_mismatch_unary("++", v, heap)),
        },
        Opcode::Decr => match v {
            Value::Int(i) => Ok(Value::Int(i.wrapping_sub(1))),
            Value::Float(f) => Ok(Value::Float(f - 1.0)),
            _ => Err(type_mismatch_unary("--", v, heap)),
        },
        _ => Err(RunError::type_error(format!("{} is not a unary operator", op.mnemonic()))),
    }
}

/// Evaluates a `CMP` relation (an [`iarg`] constant) to 1 or 0.
pub fn compare(rel: u8, lhs: &Value, rhs: &Value, heap: &Heap, interns: &Interns) -> RunResult<Value> {
    let res = match rel {
        iarg::EQ => values_eq(lhs, rhs, heap, interns),
        iarg::NEQ => !values_eq(lhs, rhs, heap, interns),
        iarg::LT | iarg::GT | iarg::LEQ | iarg::GEQ => {
            let ord = order(lhs, rhs, heap, interns)?;
            match rel {
                iarg::LT => ord == std::cmp::Ordering::Less,
                iarg::GT => ord == std::cmp::Ordering::Greater,
                iarg::LEQ => ord != std::cmp::Ordering::Greater,
                _ => ord != std::cmp::Ordering::Less,
            }
        }
        _ => return Err(RunError::system(format!("bad CMP relation {rel}"))),
    };
    Ok(Value::Int(i64::from(res)))
}

/// Structural equality: numeric values compare across int/float/complex,
/// strings and bytes by content, everything else by heap identity.
#[must_use]
pub fn values_eq(lhs: &Value, rhs: &Value, heap: &Heap, interns: &Interns) -> bool {
    if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs)
        && a == b
    {
        return true;
    }
    if let (Some(a), Some(b)) = (numeric_complex(lhs, heap), numeric_complex(rhs, heap)) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (lhs.as_str(heap, interns), rhs.as_str(heap, interns)) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (lhs.as_bytes(heap, interns), rhs.as_bytes(heap, interns)) {
        return a == b;
    }
    matches!((lhs, rhs), (Value::Null, Value::Null))
}

fn order(lhs: &Value, rhs: &Value, heap: &Heap, interns: &Interns) -> RunResult<std::cmp::Ordering> {
    // int-int stays exact; everything else numeric goes through f64.
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return Ok(a.cmp(b));
    }
    if let (Some(a), Some(b)) = (numeric_f64(lhs), numeric_f64(rhs)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| RunError::value_error("cannot order NaN"));
    }
    if let (Some(a), Some(b)) = (lhs.as_str(heap, interns), rhs.as_str(heap, interns)) {
        return Ok(a.cmp(b));
    }
    if let (Some(a), Some(b)) = (lhs.as_bytes(heap, interns), rhs.as_bytes(heap, interns)) {
        return Ok(a.cmp(b));
    }
    Err(RunError::type_error(format!(
        "cannot order {} and {}",
        lhs.type_of(heap).name(),
        rhs.type_of(heap).name()
    )))
}

fn add(lhs: &Value, rhs: &Value, heap: &mut Heap, interns: &Interns) -> RunResult<Value> {
    // Sequence concatenation first, numeric promotion second.
    if let (Some(a), Some(b)) = (lhs.as_str(heap, interns), rhs.as_str(heap, interns)) {
        let joined = {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            s
        };
        let id = heap.allocate(HeapData::Str(EcStr::new(joined)));
        return Ok(Value::Ref(id));
    }
    if let (Some(a), Some(b)) = (lhs.as_bytes(heap, interns), rhs.as_bytes(heap, interns)) {
        let joined = [a, b].concat();
        let id = heap.allocate(HeapData::Bytes(EcBytes::new(joined)));
        return Ok(Value::Ref(id));
    }
    if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
        match (heap.get(*a), heap.get(*b)) {
            (HeapData::List(la), HeapData::List(lb)) => {
                let items: Vec<Value> = la
                    .items()
                    .iter()
                    .chain(lb.items().iter())
                    .map(|v| v.clone_with_heap(heap))
                    .collect();
                let id = heap.allocate(HeapData::List(List::from_items(items)));
                return Ok(Value::Ref(id));
            }
            (HeapData::Tuple(ta), HeapData::Tuple(tb)) => {
                let items: Vec<Value> = ta
                    .items()
                    .iter()
                    .chain(tb.items().iter())
                    .map(|v| v.clone_with_heap(heap))
                    .collect();
                let id = heap.allocate(HeapData::Tuple(Tuple::from_items(items)));
                return Ok(Value::Ref(id));
            }
            _ => {}
        }
    }
    arith(Opcode::Add, lhs, rhs, heap, i64::wrapping_add, |a, b| a + b)
}

/// Shared int/float/complex arithmetic with promotion.
fn arith(
    op: Opcode,
    lhs: &Value,
    rhs: &Value,
    heap: &mut Heap,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> RunResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return Ok(Value::Int(int_op(*a, *b)));
    }
    if let (Some(a), Some(b)) = (numeric_complex(lhs, heap), numeric_complex(rhs, heap)) {
        if a.im != 0.0 || b.im != 0.0 {
            let c = match op {
                Opcode::Add => Complex {
                    re: a.re + b.re,
                    im: a.im + b.im,
                },
                Opcode::Sub => Complex {
                    re: a.re - b.re,
                    im: a.im - b.im,
                },
                Opcode::Mul => Complex {
                    re: a.re * b.re - a.im * b.im,
                    im: a.re * b.im + a.im * b.re,
                },
                _ => {
                    return Err(RunError::type_error(format!(
                        "{} not supported for complex",
                        op.mnemonic()
                    )));
                }
            };
            let id = heap.allocate(HeapData::Complex(c));
            return Ok(Value::Ref(id));
        }
        return Ok(Value::Float(float_op(a.re, b.re)));
    }
    Err(type_mismatch(op, lhs, rhs, heap))
}

fn div(lhs: &Value, rhs: &Value, heap: &mut Heap) -> RunResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if *b == 0 {
            return Err(RunError::value_error("division by zero"));
        }
        return Ok(Value::Int(a.wrapping_div(*b)));
    }
    if let (Some(a), Some(b)) = (numeric_f64(lhs), numeric_f64(rhs)) {
        // IEEE semantics for float division: x/0.0 is inf/nan, not an error.
        return Ok(Value::Float(a / b));
    }
    Err(type_mismatch(Opcode::Div, lhs, rhs, heap))
}

fn modulo(lhs: &Value, rhs: &Value, heap: &mut Heap) -> RunResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if *b == 0 {
            return Err(RunError::value_error("modulo by zero"));
        }
        return Ok(Value::Int(a.wrapping_rem(*b)));
    }
    if let (Some(a), Some(b)) = (numeric_f64(lhs), numeric_f64(rhs)) {
        return Ok(Value::Float(a % b));
    }
    Err(type_mismatch(Opcode::Mod, lhs, rhs, heap))
}

fn pow(lhs: &Value, rhs: &Value, heap: &mut Heap) -> RunResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if *b >= 0 {
            if let Ok(exp) = u32::try_from(*b)
                && let Some(v) = a.checked_pow(exp)
            {
                return Ok(Value::Int(v));
            }
            return Err(RunError::value_error("integer power overflow"));
        }
        return Ok(Value::Float((*a as f64).powf(*b as f64)));
    }
    if let (Some(a), Some(b)) = (numeric_f64(lhs), numeric_f64(rhs)) {
        return Ok(Value::Float(a.powf(b)));
    }
    Err(type_mismatch(Opcode::Pow, lhs, rhs, heap))
}

fn shift(lhs: &Value, rhs: &Value, heap: &Heap, left: bool) -> RunResult<Value> {
    let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
        let op = if left { Opcode::Lshift } else { Opcode::Rshift };
        return Err(type_mismatch(op, lhs, rhs, heap));
    };
    if *b < 0 || *b >= 64 {
        return Err(RunError::value_error(format!("shift count {b} out of range")));
    }
    let n = *b as u32;
    Ok(Value::Int(if left { a.wrapping_shl(n) } else { a.wrapping_shr(n) }))
}

fn bitwise(op: Opcode, lhs: &Value, rhs: &Value, heap: &Heap, f: fn(i64, i64) -> i64) -> RunResult<Value> {
    let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
        return Err(type_mismatch(op, lhs, rhs, heap));
    };
    Ok(Value::Int(f(*a, *b)))
}

/// The mapping union protocol: a fresh dict holding the left operand's
/// entries overlaid with the right's (the right wins on shared keys).
/// Entry const/private flags travel with their entries.
fn dict_union(a: crate::heap::HeapId, b: crate::heap::HeapId, heap: &mut Heap) -> RunResult<Value> {
    let mut pairs: Vec<(String, Value, bool, bool)> = Vec::new();
    for id in [a, b] {
        let HeapData::Dict(d) = heap.get(id) else {
            unreachable!("caller checked both operands are dicts");
        };
        for entry in d.entries() {
            pairs.push((
                entry.key().to_owned(),
                entry.value.clone_with_heap(heap),
                entry.constant,
                entry.private,
            ));
        }
    }
    let mut out = crate::types::Dict::new();
    for (key, value, constant, private) in pairs {
        if let Some(old) = out.insert(&key, value, constant, private) {
            old.drop_with_heap(heap);
        }
    }
    Ok(Value::Ref(heap.allocate(HeapData::Dict(out))))
}

/// Widens an int/float/complex to a complex pair for promotion.
fn numeric_complex(v: &Value, heap: &Heap) -> Option<Complex> {
    match v {
        Value::Int(i) => Some(Complex {
            re: *i as f64,
            im: 0.0,
        }),
        Value::Float(f) => Some(Complex { re: *f, im: 0.0 }),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Complex(c) => Some(*c),
            _ => None,
        },
        _ => None,
    }
}

/// Widens a real numeric to f64 (complex excluded: not orderable).
fn numeric_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn type_mismatch(op: Opcode, lhs: &Value, rhs: &Value, heap: &Heap) -> RunError {
    RunError::type_error(format!(
        "unsupported operand types for {}: {} and {}",
        op.mnemonic(),
        type_name_of(lhs, heap),
        type_name_of(rhs, heap),
    ))
}

fn type_mismatch_unary(sym: &str, v: &Value, heap: &Heap) -> RunError {
    RunError::type_error(format!("unsupported operand type for {sym}: {}", type_name_of(v, heap)))
}

fn type_name_of(v: &Value, heap: &Heap) -> &'static str {
    match v {
        Value::Slot(_) => "slot",
        other => {
            let ty: Type = other.type_of(heap);
            ty.name()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> (Heap, Interns) {
        (Heap::new(), Interns::new())
    }

    #[test]
    fn int_float_promotion() {
        let (mut heap, interns) = env();
        let v = binary_op(Opcode::Add, &Value::Int(2), &Value::Float(0.5), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 2.5));
        let v = binary_op(Opcode::Mul, &Value::Int(3), &Value::Int(4), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Int(12)));
    }

    #[test]
    fn division_by_zero() {
        let (mut heap, interns) = env();
        let err = binary_op(Opcode::Div, &Value::Int(1), &Value::Int(0), &mut heap, &interns).unwrap_err();
        assert_eq!(err.exc_type(), crate::exc::ExcType::ValueError);
        // Float division follows IEEE instead.
        let v = binary_op(Opcode::Div, &Value::Float(1.0), &Value::Float(0.0), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn string_concat_allocates_heap_string() {
        let (mut heap, mut interns) = env();
        let a = Value::Str(interns.intern("foo"));
        let b = Value::Str(interns.intern("bar"));
        let v = binary_op(Opcode::Add, &a, &b, &mut heap, &interns).unwrap();
        assert_eq!(v.as_str(&heap, &interns), Some("foobar"));
        v.drop_with_heap(&mut heap);
    }

    #[test]
    fn power() {
        let (mut heap, interns) = env();
        let v = binary_op(Opcode::Pow, &Value::Int(2), &Value::Int(10), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Int(1024)));
        let v = binary_op(Opcode::Pow, &Value::Int(2), &Value::Int(-1), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 0.5));
    }

    #[test]
    fn comparisons() {
        let (heap, mut interns) = env();
        let one_lt_two = compare(iarg::LT, &Value::Int(1), &Value::Int(2), &heap, &interns).unwrap();
        assert!(matches!(one_lt_two, Value::Int(1)));
        let eq = compare(
            iarg::EQ,
            &Value::Int(1),
            &Value::Float(1.0),
            &heap,
            &interns,
        )
        .unwrap();
        assert!(matches!(eq, Value::Int(1)));
        let a = Value::Str(interns.intern("abc"));
        let b = Value::Str(interns.intern("abd"));
        let lt = compare(iarg::LT, &a, &b, &heap, &interns).unwrap();
        assert!(matches!(lt, Value::Int(1)));
        assert!(compare(iarg::LT, &Value::Null, &Value::Int(1), &heap, &interns).is_err());
    }

    #[test]
    fn shifts_bounded() {
        let (mut heap, interns) = env();
        let v = binary_op(Opcode::Lshift, &Value::Int(1), &Value::Int(4), &mut heap, &interns).unwrap();
        assert!(matches!(v, Value::Int(16)));
        assert!(binary_op(Opcode::Lshift, &Value::Int(1), &Value::Int(64), &mut heap, &interns).is_err());
    }
}
