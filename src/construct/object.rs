//! The heap object model: strings, functions, arrays, classes, instances,
//! and bound methods, all living behind one intrusive, GC-managed header.
//!
//! Rather than Passerine's NaN-boxed `Tagged` pointers (see the teacher's
//! `vm::tag::Tagged`), heap references here are a plain [`ObjRef`] wrapping
//! a `NonNull<Obj>`: the value representation in [`crate::construct::value`]
//! is a small tagged union instead of a boxed float, which keeps the mark
//! phase (walking live [`Value`]s to find heap references) straightforward.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

use crate::construct::chunk::Chunk;
use crate::construct::value::Value;

/// A property table: an ordered list of (interned name, value) pairs.
/// Names are compared by pointer identity, per the interning invariant —
/// two property tables can never disagree about whether two name refs are
/// "the same name" as long as both came from the same intern table.
pub type PropertyTable = Vec<(ObjRef, Value)>;

pub fn property_get(table: &PropertyTable, name: ObjRef) -> Option<Value> {
    table.iter().find(|(n, _)| n.same_identity(name)).map(|(_, v)| *v)
}

/// Inserts or overwrites a property, preserving the position of an existing
/// entry so property tables stay stable under repeated assignment.
pub fn property_set(table: &mut PropertyTable, name: ObjRef, value: Value) {
    if let Some(entry) = table.iter_mut().find(|(n, _)| n.same_identity(name)) {
        entry.1 = value;
    } else {
        table.push((name, value));
    }
}

/// A heap-allocated, interned UTF-8 string.
#[derive(Debug)]
pub struct ObjString {
    pub value: String,
    pub hash: u64,
}

/// A compiled function: its arity, the register count its frame needs, its
/// bytecode, and an optional name (for stack traces and printing).
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub register_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

/// A class: its name and an ordered method table.
#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: RefCell<PropertyTable>,
}

/// An instance of a class, with its own field table.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: RefCell<PropertyTable>,
}

/// A method that has been read off an instance without being called yet:
/// the receiver it was read from, paired with the underlying function.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// The payload of a heap object, discriminated by variant.
#[derive(Debug)]
pub enum ObjKind {
    Str(ObjString),
    Function(ObjFunction),
    Array(RefCell<Vec<Value>>),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::Str(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Array(_) => "array",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }
}

/// The header every heap object carries: a mark bit for the GC, and the
/// forward link in the VM's intrusive allocation list. New objects are
/// prepended to this list, which is the GC's complete sweep set.
pub struct Obj {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<Obj>>>,
    pub kind: ObjKind,
}

/// A reference to a heap object.
///
/// This is a thin `Copy` wrapper around a raw, non-null pointer: heap
/// objects are owned by the intrusive list in [`crate::gc::Heap`], not by
/// any individual `ObjRef`, so there's no refcounting here — reachability
/// (and thus lifetime) is entirely the GC's job. Dereferencing is `unsafe`
/// only in the sense that any raw pointer is; every `ObjRef` the rest of
/// this crate hands out points at a live object for as long as it's
/// reachable from a root, which the GC's marking discipline guarantees.
#[derive(Clone, Copy)]
pub struct ObjRef(pub NonNull<Obj>);

impl ObjRef {
    /// Wraps a raw pointer freshly produced by the allocator.
    ///
    /// # Safety
    /// `ptr` must point at a live, fully-initialized [`Obj`].
    pub unsafe fn new(ptr: NonNull<Obj>) -> ObjRef {
        ObjRef(ptr)
    }

    pub fn as_obj(&self) -> &Obj {
        unsafe { self.0.as_ref() }
    }

    pub fn kind(&self) -> &ObjKind {
        &self.as_obj().kind
    }

    /// Pointer-identity comparison — the rule every non-string heap object
    /// uses for equality, and the rule property tables use to compare
    /// interned names.
    pub fn same_identity(&self, other: ObjRef) -> bool {
        self.0 == other.0
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.kind() {
            ObjKind::Str(s) => Some(&s.value),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self.kind() {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.0.as_ptr())
    }
}

/// FNV-1a, matching the hash the intern table and `ObjString` both use.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
