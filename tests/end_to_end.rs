//! End-to-end pipeline tests: lex, parse, compile, and run a whole snippet
//! through `quill::run_source` and check the top-level result value.

use quill::common::error::PipelineError;
use quill::common::source::Source;

fn run(source: &str) -> Result<String, PipelineError> {
    quill::run_source(Source::source(source), false).map(|v| v.to_string())
}

#[test]
fn let_bindings_and_addition() {
    assert_eq!(run("let x = 41; let y = 1; x + y;").unwrap(), "42");
}

#[test]
fn if_else_arithmetic() {
    let source = "let x = 5; let y; if (x > 3) { y = x + 6; } else { y = 0; } y;";
    assert_eq!(run(source).unwrap(), "11");
}

#[test]
fn function_call() {
    let source = "function add(a, b) { return a + b; } add(3, 4);";
    assert_eq!(run(source).unwrap(), "7");
}

#[test]
fn while_loop_sum() {
    let source = "let i = 0; let sum = 0; while (i < 4) { sum = sum + i; i = i + 1; } sum;";
    assert_eq!(run(source).unwrap(), "6");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("\"foo\" + \"bar\";").unwrap(), "foobar");
}

#[test]
fn class_constructor_and_method() {
    let source = "\
        class Counter {
            constructor() { this.count = 0; }
            bump() { this.count += 1; return this.count; }
        }
        let c = Counter();
        c.bump();
    ";
    assert_eq!(run(source).unwrap(), "1");
}

#[test]
fn array_literal_plus_equal_and_indexing() {
    let source = "let a = [1, 2]; a += [3, 4]; a[3];";
    assert_eq!(run(source).unwrap(), "4");
}

#[test]
fn missing_expression_is_a_parse_error() {
    assert!(matches!(run("let x = ;"), Err(PipelineError::Parse(_))));
}

#[test]
fn calling_a_non_function_is_a_runtime_error() {
    assert!(matches!(run("let x = 5; x();"), Err(PipelineError::Runtime(_))));
}

#[test]
fn undefined_global_is_a_runtime_error() {
    assert!(matches!(run("undefined_name;"), Err(PipelineError::Runtime(_))));
}
