//! The register-based bytecode interpreter: call frames, the value stack,
//! globals, and dispatch over every opcode in [`crate::construct::opcode`].

mod frame;
mod vm;

pub use vm::VM;
