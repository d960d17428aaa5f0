//! The tagged-union value representation shared by registers, globals,
//! object fields, and the constant pool.

use std::fmt;

use crate::construct::object::{ObjKind, ObjRef};

/// A Quill value. Copied by plain bitwise assignment — only the `Object`
/// variant participates in GC, everything else is inline data.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Object(ObjRef),
}

impl Value {
    /// `null` and `false` are the only falsy values.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_object().and_then(|o| o.as_str())
    }

    pub fn is_array(&self) -> bool {
        matches!(self.as_object().map(|o| o.kind()), Some(ObjKind::Array(_)))
    }

    /// A short, stable name for error messages (e.g. "Expected a number,
    /// found a string").
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Object(o) => o.kind().type_name(),
        }
    }
}

/// Value equality: same-variant structural equality, with heap references
/// special-cased so strings compare by content and everything else compares
/// by identity. Used by the `EQ` opcode, which — unlike `GT`/`LT` — never
/// raises a type error.
pub fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => match (x.kind(), y.kind()) {
            (ObjKind::Str(a), ObjKind::Str(b)) => a.value == b.value,
            _ => x.same_identity(y),
        },
        _ => false,
    }
}

impl fmt::Display for Value {
    /// Renders a value the way the CLI prints a program's result: `null`,
    /// `true`/`false`, shortest-round-trip numbers, raw string bytes,
    /// `<function NAME>` where `NAME` is the function's name or the literal
    /// `<fn>` if it has none, and `<object>` for anything else.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Object(o) => match o.kind() {
                ObjKind::Str(s) => write!(f, "{}", s.value),
                ObjKind::Function(func) => {
                    let name = match func.name {
                        Some(name) => name.as_str().unwrap_or("?").to_string(),
                        None => "<fn>".to_string(),
                    };
                    write!(f, "<function {}>", name)
                }
                _ => write!(f, "<object>"),
            },
        }
    }
}

/// Formats a double the way the host's `%g` would: the shortest decimal
/// representation that round-trips, with no trailing `.0` for integral
/// values (Rust's `{}` for `f64` already satisfies this — it's the
/// shortest round-tripping representation per `core::fmt` — except it keeps
/// a trailing `.0` that host `%g` output drops for integral values).
fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
