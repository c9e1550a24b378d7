//! End-to-end language tests: compile and run real scripts, observe their
//! printed output and the resulting globals.

use evilcandy::{CollectStringPrint, ExcType, Interp, Object, Opcode, Rodata};
use pretty_assertions::assert_eq;

/// Runs a script, returning the interpreter and everything it printed.
fn run(src: &str) -> (Interp, String) {
    let writer = CollectStringPrint::new();
    let handle = writer.handle();
    let mut interp = Interp::with_writer(Box::new(writer));
    interp.run_source(src, "test.evc").unwrap();
    let out = handle.borrow().clone();
    (interp, out)
}

/// Runs a script expected to fail, returning the error and prior output.
fn run_err(src: &str) -> evilcandy::RunError {
    let mut interp = Interp::with_writer(Box::new(CollectStringPrint::new()));
    interp.run_source(src, "test.evc").unwrap_err()
}

#[test]
fn arithmetic_is_constant_folded() {
    let (_, out) = run("let x = 2 + 3 * 4; print(x);");
    assert_eq!(out, "14\n");

    // The compiled entry point carries a single PUSH_CONST loading 14:
    // the folder collapsed the whole expression.
    let mut interp = Interp::new();
    let xptr = interp.compile("let x = 2 + 3 * 4; print(x);", "t.evc").unwrap();
    let pushes: Vec<_> = xptr
        .instr
        .iter()
        .filter(|ii| ii.code == Opcode::PushConst)
        .collect();
    assert_eq!(pushes.len(), 1);
    let slot = pushes[0].arg2 as usize;
    assert!(matches!(xptr.rodata[slot], Rodata::Int(14)));
}

#[test]
fn folded_and_runtime_results_agree() {
    // The same operator table runs at compile and run time; forcing the
    // runtime path through a variable must give the folder's answer.
    let (_, out) = run("let two = 2; let a = two + 3 * 4; let b = 2 + 3 * 4; print(a == b);");
    assert_eq!(out, "1\n");
}

#[test]
fn dict_store_and_fetch() {
    let (interp, out) = run(r#"let d = {a: 1, b: 2}; d["a"] = d["a"] + d["b"]; print(d["a"]);"#);
    assert_eq!(out, "3\n");
    let Some(Object::Dict(pairs)) = interp.global("d") else {
        panic!("d is not a dict");
    };
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0], ("a".to_owned(), Object::Int(3)));
    assert_eq!(pairs[1], ("b".to_owned(), Object::Int(2)));
}

#[test]
fn default_arguments() {
    let (_, out) = run("function f(x, y = 10) { return x + y; } print(f(5)); print(f(5, 6));");
    assert_eq!(out, "15\n11\n");
}

#[test]
fn string_len_counts_codepoints() {
    let (_, out) = run(r#"let s = "héllo"; print(s.len());"#);
    assert_eq!(out, "5\n");
}

#[test]
fn mutating_a_list_during_foreach_raises() {
    let err = run_err("let a = [1, 2, 3]; a.foreach(function(v) { a.append(v); });");
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().contains("locked list") || err.message().contains("locked"));
}

#[test]
fn foreach_visits_elements_in_order() {
    let (_, out) = run("let a = [5, 6, 7]; a.foreach(function(v, i) { print(i, v); });");
    assert_eq!(out, "0 5\n1 6\n2 7\n");
}

#[test]
fn dict_foreach_iterates_a_snapshot() {
    // Inserting during the walk is permitted; the callback sees the keys
    // present at iteration start.
    let (interp, out) = run(
        r#"
let seen = 0;
let d = {a: 1};
d.foreach(function(v, k) {
    seen = seen + v;
    d["extra"] = 9;
});
print(seen);
"#,
    );
    assert_eq!(out, "1\n");
    let Some(Object::Dict(pairs)) = interp.global("d") else {
        panic!("d is not a dict");
    };
    assert_eq!(pairs.len(), 2);
}

#[test]
fn closures_capture_cells() {
    let (_, out) = run(
        r"
function counter() {
    let n = 0;
    return function() { n = n + 1; return n; };
}
let c = counter();
print(c()); print(c()); print(c());
let c2 = counter();
print(c2());
",
    );
    assert_eq!(out, "1\n2\n3\n1\n");
}

#[test]
fn explicit_closure_parameter() {
    let (_, out) = run(
        r"
let base = 100;
function add(x, :k = base) { return x + k; }
base = 0;
print(add(7));
",
    );
    // The capture bound the value at definition time.
    assert_eq!(out, "107\n");
}

#[test]
fn lambdas() {
    let (_, out) = run("let sq = ``(x) x * x``; print(sq(6));");
    assert_eq!(out, "36\n");
}

#[test]
fn while_break_unwinds_locals() {
    let (_, out) = run(
        r"
function f() {
    let n = 0;
    while (true) {
        let x = n * 10;
        if (n > 2) { let z = x; break; }
        n = n + 1;
    }
    return n;
}
print(f());
",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn nested_loops_break_targets_innermost() {
    let (_, out) = run(
        r"
function f() {
    let total = 0;
    for (let i = 0; i < 3; i = i + 1) {
        while (true) { break; }
        total = total + 1;
    }
    return total;
}
print(f());
",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn do_while_runs_at_least_once() {
    let (_, out) = run("let x = 0; do { x = x + 1; } while (x < 3); print(x); do x = x + 10; while (false); print(x);");
    assert_eq!(out, "3\n13\n");
}

#[test]
fn for_else_runs_on_exhaustion_not_break() {
    let (_, out) = run(
        r"
function exhaust() {
    for (let i = 0; i < 3; i = i + 1) { ; } else return 100;
    return 1;
}
function broken() {
    let n = 0;
    for (;;) { n = n + 1; if (n > 1) break; } else return 100;
    return n;
}
print(exhaust()); print(broken());
",
    );
    assert_eq!(out, "100\n2\n");
}

#[test]
fn const_binding_locks_on_first_store() {
    let err = run_err("let const pi = 3; pi = 4;");
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert!(err.message().contains("const"));
}

#[test]
fn const_object_entries_reject_stores() {
    let err = run_err("let o = {const k: 1}; o.k = 2;");
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
}

#[test]
fn private_entries_visible_only_through_this() {
    let (_, out) = run(
        r"
let o = {
    private secret: 7,
    reveal: function() { return this.secret; }
};
print(o.reveal());
",
    );
    assert_eq!(out, "7\n");

    let err = run_err("let o = {private secret: 7}; print(o.secret);");
    assert_eq!(err.exc_type(), ExcType::AttributeError);
}

#[test]
fn this_and_global_address_the_globals_object() {
    let (_, out) = run("this.q = 5; print(q); global.w = 2; print(w + q);");
    assert_eq!(out, "5\n7\n");
}

#[test]
fn method_calls_know_their_receiver() {
    let (_, out) = run(
        r"
let obj = {
    value: 40,
    get: function(extra) { return this.value + extra; }
};
print(obj.get(2));
",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn ranges() {
    let (_, out) = run("let r = range(2, 11, 3); print(len(r)); print(r[1]); print(r[-1]);");
    assert_eq!(out, "3\n5\n8\n");
    let err = run_err("let r = range(0, 5, 0);");
    assert_eq!(err.exc_type(), ExcType::ValueError);
}

#[test]
fn floats_statistics() {
    let (_, out) = run(
        r"
let f = floats([2, 4, 4, 4, 5, 5, 7, 9]);
print(f.mean()); print(f.var()); print(f.min()); print(f.max());
f.append(1.5);
print(f.len());
",
    );
    assert_eq!(out, "5.0\n4.0\n2.0\n9.0\n9\n");
}

#[test]
fn typeof_names() {
    let (_, out) = run(r#"print(typeof(3), typeof(1.5), typeof("x"), typeof(null), typeof([]), typeof({}));"#);
    assert_eq!(out, "int float string null list dict\n");
}

#[test]
fn string_and_list_concatenation() {
    let (_, out) = run(r#"let a = "foo"; let b = a + "bar"; print(b); print(([1] + [2, 3]).len());"#);
    assert_eq!(out, "foobar\n3\n");
}

#[test]
fn division_by_zero_is_a_value_error() {
    let err = run_err("let a = 0; let x = 1 / a;");
    assert_eq!(err.exc_type(), ExcType::ValueError);
    // Also when the folder sees it: the error is deferred to runtime.
    let err = run_err("let x = 1 / 0;");
    assert_eq!(err.exc_type(), ExcType::ValueError);
}

#[test]
fn deep_recursion_is_bounded() {
    let err = run_err("function f() { return f(); } let x = f();");
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
}

#[test]
fn calling_a_non_function_is_a_type_error() {
    let err = run_err("let x = 3; x();");
    assert_eq!(err.exc_type(), ExcType::TypeError);
}

#[test]
fn missing_symbol_reports_its_name() {
    let err = run_err("print(flibbertigibbet);");
    assert!(err.message().contains("flibbertigibbet"));
}

#[test]
fn missing_dict_key_is_a_key_error() {
    let err = run_err(r#"let d = {a: 1}; print(d["zz"]);"#);
    assert_eq!(err.exc_type(), ExcType::KeyError);
}

#[test]
fn compound_assignment_operators() {
    let (_, out) = run(
        r"
let x = 10;
x += 5; x -= 1; x *= 2; x /= 7;
print(x);
let b = 6;
b &= 3; b |= 8; b ^= 1; b <<= 2; b >>= 1;
print(b);
x++; print(x);
x--; x--; print(x);
",
    );
    assert_eq!(out, "4\n22\n5\n3\n");
}

#[test]
fn string_subscripts() {
    let (_, out) = run(r#"let s = "héllo"; print(s[1]); print(s[-1]);"#);
    assert_eq!(out, "é\no\n");
}

#[test]
fn bytes_literals_and_len() {
    let (_, out) = run(r#"let b = b"\x00\x01abc"; print(b.len()); print(b[1]);"#);
    assert_eq!(out, "5\n1\n");
}

#[test]
fn list_sort() {
    let (interp, out) = run("let a = [3, 1, 2]; a.sort(); print(a);");
    assert_eq!(out, "[1, 2, 3]\n");
    assert_eq!(
        interp.global("a"),
        Some(Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)]))
    );
}

#[test]
fn load_shares_the_global_environment() {
    let dir = std::env::temp_dir().join(format!("evilcandy-load-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("helper.evc"), "let loaded_value = 99;\n").unwrap();
    let main_path = dir.join("main.evc");
    std::fs::write(&main_path, "load \"helper.evc\";\nprint(loaded_value);\n").unwrap();

    let writer = CollectStringPrint::new();
    let handle = writer.handle();
    let mut interp = Interp::with_writer(Box::new(writer));
    let src = std::fs::read_to_string(&main_path).unwrap();
    interp.run_source(&src, &main_path.display().to_string()).unwrap();
    assert_eq!(&*handle.borrow(), "99\n");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn load_is_allowed_inside_an_if_body() {
    let dir = std::env::temp_dir().join(format!("evilcandy-ifload-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("cond.evc"), "let cond_value = 5;\n").unwrap();
    let main_path = dir.join("main.evc");
    std::fs::write(&main_path, "if (true) { load \"cond.evc\"; }\nprint(cond_value);\n").unwrap();

    let writer = CollectStringPrint::new();
    let handle = writer.handle();
    let mut interp = Interp::with_writer(Box::new(writer));
    let src = std::fs::read_to_string(&main_path).unwrap();
    interp.run_source(&src, &main_path.display().to_string()).unwrap();
    assert_eq!(&*handle.borrow(), "5\n");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn temporaries_do_not_leak() {
    // After a run that churns through lists, dicts, strings, and function
    // calls, the only live heap objects are the globals dict and the
    // `work` function bound in it: every temporary's destructor ran
    // exactly once.
    let (interp, _) = run(
        r#"
function work(n) {
    let acc = [];
    for (let i = 0; i < n; i = i + 1) {
        acc.append({k: "v" + str(i)});
    }
    return acc.len();
}
let r = work(10);
print(r);
"#,
    );
    assert_eq!(interp.global("r"), Some(Object::Int(10)));
    assert_eq!(interp.heap_live(), 2);
}

#[test]
fn every_reachable_global_value_is_live() {
    let (interp, _) = run("let a = [1, 2]; let b = a; print(b.len());");
    // One list, shared by two globals, plus the globals object.
    assert_eq!(interp.heap_live(), 2);
    assert_eq!(interp.global("a"), interp.global("b"));
}

#[test]
fn logical_operators_yield_ints() {
    let (_, out) = run(r#"print(1 && 0, 1 || 0, !3, !0, 2 < 3, "a" < "b");"#);
    assert_eq!(out, "0 1 0 1 1 1\n");
}

#[test]
fn power_operator() {
    let (_, out) = run("print(2 ** 10); let n = 2; print(n ** 3); print(-2 ** 2);");
    assert_eq!(out, "1024\n8\n-4\n");
}

#[test]
fn tuple_conversion() {
    let (interp, out) = run("let t = tuple([1, 2]); print(typeof(t)); print(t.len());");
    assert_eq!(out, "tuple\n2\n");
    assert_eq!(
        interp.global("t"),
        Some(Object::Tuple(vec![Object::Int(1), Object::Int(2)]))
    );
}

#[test]
fn dict_union_operator() {
    let (interp, out) = run(r"let merged = {a: 1, b: 2} | {b: 20, c: 3}; print(merged.len());");
    assert_eq!(out, "3\n");
    let Some(Object::Dict(pairs)) = interp.global("merged") else {
        panic!("merged is not a dict");
    };
    assert_eq!(
        pairs,
        vec![
            ("a".to_owned(), Object::Int(1)),
            ("b".to_owned(), Object::Int(20)),
            ("c".to_owned(), Object::Int(3)),
        ]
    );
}

#[test]
fn string_slice_counts_codepoints() {
    let (_, out) = run(r#"let s = "héllo"; print(s.slice(1, 3)); print(s.slice(-2, 99)); print(s.slice(1));"#);
    assert_eq!(out, "él\nlo\néllo\n");
}

#[test]
fn int_float_promotion_and_comparison() {
    let (_, out) = run("print(1 + 0.5); print(2 == 2.0); print(3 % 2); print(7 / 2); print(7.0 / 2);");
    assert_eq!(out, "1.5\n1\n1\n3\n3.5\n");
}
