//! The heap and its mark-and-sweep garbage collector.
//!
//! Every object created by the compiler or the VM — interned strings,
//! compiled functions, arrays, classes, instances, bound methods — is
//! allocated here and lives on one intrusive, singly-linked list rooted at
//! [`Heap::head`]. Collection is tri-color mark-and-sweep with an explicit
//! gray stack: no refcounting anywhere, because the object graph (an
//! instance pointing at its class, whose methods close over constants that
//! may include the class's own name) is routinely cyclic.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use log::trace;

use crate::construct::intern::Interner;
use crate::construct::object::{fnv1a, Obj, ObjKind, ObjRef, ObjString};
use crate::construct::value::Value;

/// Below this many bytes allocated, never bother collecting — matches the
/// teacher corpus's common floor for toy VMs and keeps small scripts from
/// paying for a GC pass at all.
const MIN_THRESHOLD: usize = 1024;

/// The GC-managed heap owned by one VM instance.
pub struct Heap {
    head: Cell<Option<NonNull<Obj>>>,
    bytes_allocated: Cell<usize>,
    threshold: Cell<usize>,
    /// Behind a `RefCell` rather than a plain field so that both the
    /// compiler (interning string constants ahead of execution) and the VM
    /// (interning the result of runtime string concatenation) can intern
    /// through a shared `&Heap` without needing exclusive access.
    interner: RefCell<Interner>,
    /// When set, every allocation collects first. Used by `--gc-stress` to
    /// shake out reachability bugs that a lucky allocation pattern would
    /// otherwise hide.
    pub stress_mode: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            head: Cell::new(None),
            bytes_allocated: Cell::new(0),
            threshold: Cell::new(MIN_THRESHOLD),
            interner: RefCell::new(Interner::new()),
            stress_mode: false,
        }
    }

    pub fn interned_count(&self) -> usize {
        self.interner.borrow().len()
    }

    /// Returns the canonical string object for `contents`, allocating and
    /// interning a fresh one if no live string with this content exists yet.
    /// Both the compiler (string literals, property/method names) and the
    /// VM (string concatenation results) go through this single path, which
    /// is what makes interning-uniqueness (invariant 1 in the object model)
    /// hold everywhere a string can come from.
    pub fn intern_string(&self, contents: &str) -> ObjRef {
        if let Some(existing) = self.interner.borrow().find(contents) {
            return existing;
        }
        let hash = fnv1a(contents.as_bytes());
        let obj = self.allocate(ObjKind::Str(ObjString { value: contents.to_string(), hash }));
        self.interner.borrow_mut().insert(contents.to_string(), obj);
        obj
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    pub fn should_collect(&self) -> bool {
        self.stress_mode || self.bytes_allocated.get() > self.threshold.get()
    }

    /// Allocates a new object of the given kind, prepending it to the
    /// allocation list. The caller is responsible for the "safety
    /// discipline" in §4.5: if the returned object isn't immediately
    /// installed somewhere a root can see, push it onto the VM's value
    /// stack before making any further allocation that could trigger a
    /// collection.
    pub fn allocate(&self, kind: ObjKind) -> ObjRef {
        let size = Self::approx_size(&kind);
        let boxed = Box::new(Obj {
            marked: Cell::new(false),
            next: Cell::new(self.head.get()),
            kind,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        self.head.set(Some(ptr));
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        unsafe { ObjRef::new(ptr) }
    }

    fn approx_size(kind: &ObjKind) -> usize {
        let base = Layout::new::<Obj>().size();
        base + match kind {
            ObjKind::Str(s) => s.value.len(),
            ObjKind::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            ObjKind::Array(a) => a.borrow().len() * std::mem::size_of::<Value>(),
            ObjKind::Class(c) => c.methods.borrow().len() * 16,
            ObjKind::Instance(i) => i.fields.borrow().len() * 16,
            ObjKind::BoundMethod(_) => 0,
        }
    }

    /// Runs one full mark-and-sweep collection. `roots` enumerates every
    /// live value reachable from the stack, the active call frames, and
    /// the globals table; see [`crate::vm::VM::gc_roots`].
    pub fn collect(&mut self, roots: impl Iterator<Item = Value>) {
        let before = self.bytes_allocated.get();
        let mut gray: Vec<ObjRef> = Vec::new();

        for value in roots {
            self.mark_value(value, &mut gray);
        }
        self.trace(&mut gray);

        self.interner.get_mut().prune_unmarked();
        self.sweep();

        let after = self.bytes_allocated.get();
        self.threshold.set(MIN_THRESHOLD.max(after * 2));
        trace!("gc: collected {} bytes ({} -> {})", before.saturating_sub(after), before, after);
    }

    pub fn mark_value(&self, value: Value, gray: &mut Vec<ObjRef>) {
        if let Value::Object(obj) = value {
            self.mark_object(obj, gray);
        }
    }

    pub fn mark_object(&self, obj: ObjRef, gray: &mut Vec<ObjRef>) {
        let header = obj.as_obj();
        if header.marked.get() {
            return;
        }
        header.marked.set(true);
        gray.push(obj);
    }

    /// Drains the gray stack, blackening each object: marking every value
    /// it points to in turn, until nothing gray remains.
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        while let Some(obj) = gray.pop() {
            self.blacken(obj, gray);
        }
    }

    fn blacken(&self, obj: ObjRef, gray: &mut Vec<ObjRef>) {
        match obj.kind() {
            ObjKind::Str(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name, gray);
                }
                for constant in &f.chunk.constants {
                    self.mark_value(*constant, gray);
                }
            }
            ObjKind::Array(a) => {
                for value in a.borrow().iter() {
                    self.mark_value(*value, gray);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name, gray);
                for (name, value) in c.methods.borrow().iter() {
                    self.mark_object(*name, gray);
                    self.mark_value(*value, gray);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class, gray);
                for (name, value) in i.fields.borrow().iter() {
                    self.mark_object(*name, gray);
                    self.mark_value(*value, gray);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver, gray);
                self.mark_object(b.method, gray);
            }
        }
    }

    /// Frees every unmarked object and clears the mark bit on survivors.
    /// Must run after [`Interner::prune_unmarked`] — pruning the table
    /// before freeing is what keeps a later lookup from reading through a
    /// dangling reference.
    fn sweep(&mut self) {
        let mut current = self.head.get();
        let mut prev: Option<NonNull<Obj>> = None;

        while let Some(node) = current {
            let header = unsafe { node.as_ref() };
            let next = header.next.get();

            if header.marked.get() {
                header.marked.set(false);
                prev = Some(node);
                current = next;
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.head.set(next),
                }
                let freed = Self::approx_size(&header.kind);
                self.bytes_allocated.set(self.bytes_allocated.get().saturating_sub(freed));
                // Safety: `node` was produced by `Box::leak` in `allocate`
                // and has just been unlinked from the only list that
                // referenced it, so this is the unique owning pointer.
                unsafe { drop(Box::from_raw(node.as_ptr())) };
                current = next;
            }
        }
    }
}

impl Drop for Heap {
    /// Frees every remaining object when the VM (and its heap) goes away.
    fn drop(&mut self) {
        let mut current = self.head.get();
        while let Some(node) = current {
            let next = unsafe { node.as_ref().next.get() };
            unsafe { drop(Box::from_raw(node.as_ptr())) };
            current = next;
        }
        self.head.set(None);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_same_contents_returns_the_same_object() {
        let heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert!(a.same_identity(b));
        assert_eq!(heap.interned_count(), 1);
    }

    #[test]
    fn interning_distinct_contents_returns_distinct_objects() {
        let heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("world");
        assert!(!a.same_identity(b));
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn collect_frees_unreached_objects_and_keeps_roots() {
        let mut heap = Heap::new();
        let root = heap.intern_string("kept");
        let _garbage = heap.intern_string("dropped");
        assert_eq!(heap.interned_count(), 2);

        heap.collect(std::iter::once(Value::Object(root)));

        assert_eq!(heap.interned_count(), 1);
        assert_eq!(heap.intern_string("kept").as_str(), Some("kept"));
    }

    #[test]
    fn collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        heap.intern_string("a");
        heap.intern_string("b");

        heap.collect(std::iter::empty());

        assert_eq!(heap.interned_count(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }
}
