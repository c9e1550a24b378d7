//! Lexer and assembler rejection tests: every failure is a `ParserError`
//! carrying file, line, and column.

use evilcandy::{ExcType, Interp};

fn compile_err(src: &str) -> evilcandy::RunError {
    let mut interp = Interp::new();
    interp.compile(src, "bad.evc").unwrap_err()
}

#[test]
fn unterminated_string() {
    let err = compile_err("let s = \"oops;\n");
    assert_eq!(err.exc_type(), ExcType::ParserError);
    assert!(err.to_string().starts_with("bad.evc:1:"));
}

#[test]
fn unterminated_block_comment() {
    let err = compile_err("let x = 1; /* no end");
    assert_eq!(err.exc_type(), ExcType::ParserError);
}

#[test]
fn malformed_numbers() {
    assert_eq!(compile_err("let x = 12abc;").exc_type(), ExcType::ParserError);
    assert_eq!(compile_err("let x = 0x;").exc_type(), ExcType::ParserError);
    assert_eq!(compile_err("let x = 0b123;").exc_type(), ExcType::ParserError);
    assert_eq!(
        compile_err("let x = 0x11223344556677889;").exc_type(),
        ExcType::ParserError
    );
    assert_eq!(compile_err("let x = 1e;").exc_type(), ExcType::ParserError);
}

#[test]
fn stray_backtick() {
    assert_eq!(compile_err("let x = `;").exc_type(), ExcType::ParserError);
}

#[test]
fn bad_escape() {
    assert_eq!(compile_err(r#"let s = "\q";"#).exc_type(), ExcType::ParserError);
}

#[test]
fn statement_must_assign_or_call() {
    // A bare value expression is not a statement.
    assert_eq!(compile_err("x;").exc_type(), ExcType::ParserError);
    assert_eq!(compile_err("a.b;").exc_type(), ExcType::ParserError);
}

#[test]
fn break_outside_loop() {
    let err = compile_err("break;");
    assert_eq!(err.exc_type(), ExcType::ParserError);
    assert!(err.message().contains("break"));
}

#[test]
fn redefinition_of_a_local() {
    let err = compile_err("function f() { let a = 1; let a = 2; }");
    assert_eq!(err.exc_type(), ExcType::ParserError);
    assert!(err.message().contains("redefinition"));
}

#[test]
fn let_in_for_step_clause() {
    let err = compile_err("for (;; let i = 0) { ; }");
    assert_eq!(err.exc_type(), ExcType::ParserError);
}

#[test]
fn load_rejected_inside_functions() {
    let err = compile_err("function f() { load \"x.evc\"; }");
    assert_eq!(err.exc_type(), ExcType::ParserError);
    assert!(err.message().contains("top level"));
}

#[test]
fn unbalanced_braces() {
    assert_eq!(compile_err("if (1) { let x = 1;").exc_type(), ExcType::ParserError);
    assert_eq!(compile_err("function f() { return 1;").exc_type(), ExcType::ParserError);
}

#[test]
fn closure_parameter_requires_initializer() {
    let err = compile_err("function f(:cap) { return cap; }");
    assert_eq!(err.exc_type(), ExcType::ParserError);
    assert!(err.message().contains("initializer"));
}

#[test]
fn lambda_must_be_terminated() {
    let err = compile_err("let f = ``(x) x + 1;");
    assert_eq!(err.exc_type(), ExcType::ParserError);
}

#[test]
fn errors_carry_line_numbers() {
    let err = compile_err("let ok = 1;\nlet also_ok = 2;\nlet bad = @;\n");
    let rendered = err.to_string();
    assert!(rendered.contains("bad.evc:3:"), "got: {rendered}");
}
