//! Quill: a small dynamically-typed scripting language.
//!
//! The pipeline is the classic four stages — lex, parse, compile, run —
//! wired together by [`run_source`]. Each stage is a module in its own
//! right ([`compiler`] covers lexing/parsing/compiling; [`vm`] covers
//! execution; [`construct`] and [`gc`] hold the shared object model and
//! heap) so each can be driven independently (e.g. by `--dump-bytecode`,
//! which stops after compiling).

pub mod common;
pub mod compiler;
pub mod construct;
pub mod gc;
pub mod vm;

use std::rc::Rc;

use crate::common::error::PipelineError;
use crate::common::source::Source;
use crate::construct::value::Value;
use crate::gc::Heap;
use crate::vm::VM;

/// Lexes, parses, compiles, and runs a complete source file, returning the
/// top-level script's result value.
///
/// `gc_stress`, when set, makes the heap collect on every single
/// allocation rather than waiting for its threshold — see `--gc-stress`.
pub fn run_source(source: Rc<Source>, gc_stress: bool) -> Result<Value, PipelineError> {
    let program = compiler::parse(source)?;
    let mut heap = Heap::new();
    heap.stress_mode = gc_stress;
    let compiled = compiler::compile(&heap, program)?;
    let mut vm = VM::new(heap, compiled.global_names);
    let value = vm.interpret(compiled.function)?;
    Ok(value)
}

/// Compiles a source file without running it, for `--dump-bytecode`.
pub fn compile_source(source: Rc<Source>) -> Result<(Heap, compiler::CompiledProgram), PipelineError> {
    let program = compiler::parse(source)?;
    let heap = Heap::new();
    let compiled = compiler::compile(&heap, program)?;
    Ok((heap, compiled))
}
