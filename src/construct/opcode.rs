//! The instruction set emitted by the compiler and interpreted by the VM.
//!
//! Every instruction is one opcode byte followed by a small, opcode-specific
//! number of operand bytes. Register operands are one byte each (the
//! register-index limit is 255); constant-pool indices, global slots, and
//! jump offsets are two bytes, big-endian.

/// A single opcode. Laid out as a plain `u8` enum (rather than the teacher's
/// `unsafe { transmute }` trick) so decoding a byte we don't control — e.g.
/// while fuzzing or reading corrupted bytecode in a test — can never be UB;
/// [`Opcode::from_byte`] returns `None` for anything out of range.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `dst, idx16` — `registers[dst] = constants[idx]`
    LoadConst = 0,
    /// `dst` — `registers[dst] = null`
    LoadNull = 1,
    /// `dst` — `registers[dst] = true`
    LoadTrue = 2,
    /// `dst` — `registers[dst] = false`
    LoadFalse = 3,
    /// `dst, src` — register copy
    Move = 4,

    /// `dst, a, b` — polymorphic add (number/string/array)
    Add = 5,
    /// `dst, a, b` — numeric subtract
    Sub = 6,
    /// `dst, a, b` — numeric multiply
    Mul = 7,
    /// `dst, a, b` — numeric divide
    Div = 8,
    /// `dst, a, b` — numeric greater-than
    Gt = 9,
    /// `dst, a, b` — numeric less-than
    Lt = 10,
    /// `dst, a, b` — value equality
    Eq = 11,
    /// `dst, a` — numeric negation
    Neg = 12,
    /// `dst, a` — logical not
    Not = 13,

    /// `off16` — `ip += off`
    Jump = 14,
    /// `cond, off16` — `if !truthy(registers[cond]) { ip += off }`
    JumpIfFalse = 15,
    /// `off16` — `ip -= off`
    Loop = 16,

    /// `dst, callee, n, r1..rn` — call `registers[callee]` with `n` args
    Call = 17,
    /// `src` — return `registers[src]` to the caller
    Return = 18,

    /// `reg, slot16` — `registers[reg] = globals[slot]`
    GetGlobal = 19,
    /// `reg, slot16` — `globals[slot] = registers[reg]`, marks slot defined
    DefineGlobal = 20,
    /// `reg, slot16` — `globals[slot] = registers[reg]`
    SetGlobal = 21,

    /// `dst, n, r1..rn` — build an array of `n` elements
    BuildArray = 22,
    /// `dst, arr, idx` — indexed read
    ArrayGet = 23,

    /// `dst, obj, name16` — read a property off an instance
    GetProperty = 24,
    /// `obj, name16, val` — write a property on an instance
    SetProperty = 25,

    /// `dst, name16` — allocate an empty class
    Class = 26,
    /// `class, name16, method` — install a method on a class
    Method = 27,
    /// `dst, obj, name16, n, r1..rn` — fused property-lookup and call
    Invoke = 28,
}

impl Opcode {
    /// Decodes a raw opcode byte, or `None` if it doesn't name a valid
    /// opcode. Bytecode is only ever produced by [`crate::compiler`], so in
    /// practice this should never fail, but the VM still checks rather than
    /// trusting arbitrary bytes.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0 => LoadConst,
            1 => LoadNull,
            2 => LoadTrue,
            3 => LoadFalse,
            4 => Move,
            5 => Add,
            6 => Sub,
            7 => Mul,
            8 => Div,
            9 => Gt,
            10 => Lt,
            11 => Eq,
            12 => Neg,
            13 => Not,
            14 => Jump,
            15 => JumpIfFalse,
            16 => Loop,
            17 => Call,
            18 => Return,
            19 => GetGlobal,
            20 => DefineGlobal,
            21 => SetGlobal,
            22 => BuildArray,
            23 => ArrayGet,
            24 => GetProperty,
            25 => SetProperty,
            26 => Class,
            27 => Method,
            28 => Invoke,
            _ => return None,
        })
    }
}
