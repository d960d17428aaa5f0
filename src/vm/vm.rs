//! The bytecode dispatch loop.

use log::trace;

use crate::common::error::{RuntimeError, TraceFrame};
use crate::construct::object::{
    property_get, property_set, ObjBoundMethod, ObjClass, ObjInstance, ObjKind, ObjRef,
};
use crate::construct::opcode::Opcode;
use crate::construct::value::{values_equal, Value};
use crate::gc::Heap;
use crate::vm::frame::Frame;

/// The interpreter for one program run. Owns the heap (and therefore every
/// object the program allocates), the register stack, the call-frame
/// stack, and the flat globals table the compiler's `GlobalTable` slots
/// index into.
pub struct VM {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Option<Value>>,
    global_names: Vec<ObjRef>,
    constructor_name: ObjRef,
}

type OpResult<T> = Result<T, String>;

impl VM {
    pub fn new(heap: Heap, global_names: Vec<ObjRef>) -> VM {
        let constructor_name = heap.intern_string("constructor");
        let globals = vec![None; global_names.len()];
        VM { heap, stack: Vec::new(), frames: Vec::new(), globals, global_names, constructor_name }
    }

    /// Runs a compiled top-level function to completion, returning its
    /// result value or the first runtime error raised along the way.
    pub fn interpret(&mut self, function: ObjRef) -> Result<Value, RuntimeError> {
        let register_count = function
            .as_function()
            .expect("VM::interpret expects a compiled function object")
            .register_count as usize;
        self.stack.clear();
        self.stack.resize(register_count, Value::Null);
        self.frames.clear();
        self.frames.push(Frame::new(function, 0, None));

        match self.run() {
            Ok(value) => Ok(value),
            Err(message) => {
                let trace = self.build_trace();
                self.stack.clear();
                self.frames.clear();
                Err(RuntimeError::new(message, trace))
            }
        }
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| TraceFrame { line: f.current_line(), name: f.name() })
            .collect()
    }

    // --- stack / register access -------------------------------------------------

    fn base(&self) -> usize {
        self.frames.last().unwrap().base
    }

    fn reg(&self, index: u8) -> Value {
        self.stack[self.base() + index as usize]
    }

    fn set_reg(&mut self, index: u8, value: Value) {
        let at = self.base() + index as usize;
        self.stack[at] = value;
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.chunk().code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u16();
        self.frames.last().unwrap().chunk().constants[idx as usize]
    }

    // --- garbage collection --------------------------------------------------------

    fn gc_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.stack.clone();
        for frame in &self.frames {
            roots.push(Value::Object(frame.function));
        }
        for global in self.globals.iter().flatten() {
            roots.push(*global);
        }
        for name in &self.global_names {
            roots.push(Value::Object(*name));
        }
        roots.push(Value::Object(self.constructor_name));
        roots
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = self.gc_roots();
        trace!("gc: triggered at {} bytes allocated", self.heap.bytes_allocated());
        self.heap.collect(roots.into_iter());
    }

    fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        self.maybe_collect();
        self.heap.allocate(kind)
    }

    // --- main loop -------------------------------------------------------------

    fn run(&mut self) -> Result<Value, String> {
        loop {
            let op_byte = self.read_u8();
            let op = Opcode::from_byte(op_byte).ok_or_else(|| "Corrupt bytecode: unknown opcode.".to_string())?;

            use Opcode::*;
            match op {
                LoadConst => {
                    let dst = self.read_u8();
                    let value = self.read_constant();
                    self.set_reg(dst, value);
                }
                LoadNull => {
                    let dst = self.read_u8();
                    self.set_reg(dst, Value::Null);
                }
                LoadTrue => {
                    let dst = self.read_u8();
                    self.set_reg(dst, Value::Bool(true));
                }
                LoadFalse => {
                    let dst = self.read_u8();
                    self.set_reg(dst, Value::Bool(false));
                }
                Move => {
                    let dst = self.read_u8();
                    let src = self.read_u8();
                    self.set_reg(dst, self.reg(src));
                }
                Add => self.op_add()?,
                Sub => self.op_numeric_binop(|a, b| a - b)?,
                Mul => self.op_numeric_binop(|a, b| a * b)?,
                Div => self.op_numeric_binop(|a, b| a / b)?,
                Gt => self.op_compare(|a, b| a > b)?,
                Lt => self.op_compare(|a, b| a < b)?,
                Eq => {
                    let dst = self.read_u8();
                    let a = self.read_u8();
                    let b = self.read_u8();
                    let result = values_equal(self.reg(a), self.reg(b));
                    self.set_reg(dst, Value::Bool(result));
                }
                Neg => {
                    let dst = self.read_u8();
                    let a = self.read_u8();
                    let n = self.reg(a).as_number().ok_or_else(|| "Operand must be a number.".to_string())?;
                    self.set_reg(dst, Value::Number(-n));
                }
                Not => {
                    let dst = self.read_u8();
                    let a = self.read_u8();
                    self.set_reg(dst, Value::Bool(!self.reg(a).is_truthy()));
                }
                Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                JumpIfFalse => {
                    let cond = self.read_u8();
                    let offset = self.read_u16();
                    if !self.reg(cond).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                Call => {
                    let dst = self.read_u8();
                    let callee = self.read_u8();
                    let n = self.read_u8();
                    let mut args = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let r = self.read_u8();
                        args.push(self.reg(r));
                    }
                    let callee_value = self.reg(callee);
                    self.dispatch_call(callee_value, &args, dst)?;
                }
                Return => {
                    let src = self.read_u8();
                    let value = self.reg(src);
                    let finished = self.frames.pop().expect("RETURN with no active frame");
                    self.stack.truncate(finished.base);
                    match finished.dest {
                        None => return Ok(value),
                        Some(dest) => {
                            self.stack[dest] = value;
                        }
                    }
                }
                GetGlobal => {
                    let dst = self.read_u8();
                    let slot = self.read_u16() as usize;
                    let value = self.globals.get(slot).and_then(|g| *g).ok_or_else(|| {
                        format!("Undefined global variable '{}'.", self.global_name(slot))
                    })?;
                    self.set_reg(dst, value);
                }
                DefineGlobal => {
                    let src = self.read_u8();
                    let slot = self.read_u16() as usize;
                    let value = self.reg(src);
                    self.globals[slot] = Some(value);
                }
                SetGlobal => {
                    let src = self.read_u8();
                    let slot = self.read_u16() as usize;
                    if self.globals.get(slot).map(Option::is_some) != Some(true) {
                        return Err(format!("Undefined global variable '{}'.", self.global_name(slot)));
                    }
                    self.globals[slot] = Some(self.reg(src));
                }
                BuildArray => self.op_build_array()?,
                ArrayGet => self.op_array_get()?,
                GetProperty => self.op_get_property()?,
                SetProperty => self.op_set_property()?,
                Class => {
                    let dst = self.read_u8();
                    let name = self.read_constant();
                    let name_ref = name.as_object().expect("class name constant must be a string");
                    let class = self.allocate(ObjKind::Class(ObjClass { name: name_ref, methods: Default::default() }));
                    self.set_reg(dst, Value::Object(class));
                }
                Method => {
                    let class_reg = self.read_u8();
                    let name = self.read_constant();
                    let method_reg = self.read_u8();
                    let name_ref = name.as_object().expect("method name constant must be a string");
                    let method_value = self.reg(method_reg);
                    let class_value = self.reg(class_reg);
                    let class_obj = class_value.as_object().ok_or_else(|| "METHOD target is not a class.".to_string())?;
                    match class_obj.kind() {
                        ObjKind::Class(c) => {
                            let mut methods = c.methods.borrow_mut();
                            property_set(&mut methods, name_ref, method_value);
                        }
                        _ => return Err("METHOD target is not a class.".to_string()),
                    }
                }
                Invoke => self.op_invoke()?,
            }
        }
    }

    // --- arithmetic --------------------------------------------------------------

    /// `ADD` is polymorphic: array concatenation/append, string
    /// concatenation, or numeric sum, tried in that order against the
    /// left operand's type.
    fn op_add(&mut self) -> Result<(), String> {
        let dst = self.read_u8();
        let a = self.read_u8();
        let b = self.read_u8();
        let left = self.reg(a);
        let right = self.reg(b);
        let type_error = "Operands must be two numbers, two strings, or an array.".to_string();

        let result = match left.as_object() {
            Some(left_obj) => match left_obj.kind() {
                ObjKind::Array(left_items) => {
                    let mut combined = left_items.borrow().clone();
                    match right.as_object() {
                        Some(right_obj) => match right_obj.kind() {
                            ObjKind::Array(right_items) => combined.extend(right_items.borrow().iter().copied()),
                            _ => combined.push(right),
                        },
                        None => combined.push(right),
                    }
                    Value::Object(self.allocate(ObjKind::Array(combined.into())))
                }
                ObjKind::Str(l) => {
                    let joined = match right.as_object() {
                        Some(right_obj) => match right_obj.kind() {
                            ObjKind::Str(r) => Some(format!("{}{}", l.value, r.value)),
                            _ => None,
                        },
                        None => None,
                    };
                    match joined {
                        Some(text) => Value::Object(self.intern(&text)),
                        None => return Err(type_error),
                    }
                }
                _ => match (left.as_number(), right.as_number()) {
                    (Some(x), Some(y)) => Value::Number(x + y),
                    _ => return Err(type_error),
                },
            },
            None => match (left.as_number(), right.as_number()) {
                (Some(x), Some(y)) => Value::Number(x + y),
                _ => return Err(type_error),
            },
        };
        self.set_reg(dst, result);
        Ok(())
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern_string(text)
    }

    fn op_numeric_binop(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), String> {
        let dst = self.read_u8();
        let a = self.read_u8();
        let b = self.read_u8();
        let x = self.reg(a).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        let y = self.reg(b).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        self.set_reg(dst, Value::Number(f(x, y)));
        Ok(())
    }

    fn op_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), String> {
        let dst = self.read_u8();
        let a = self.read_u8();
        let b = self.read_u8();
        let x = self.reg(a).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        let y = self.reg(b).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        self.set_reg(dst, Value::Bool(f(x, y)));
        Ok(())
    }

    // --- arrays / properties -------------------------------------------------------

    fn op_build_array(&mut self) -> Result<(), String> {
        let dst = self.read_u8();
        let n = self.read_u8();
        let mut values = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let r = self.read_u8();
            values.push(self.reg(r));
        }
        let array = self.allocate(ObjKind::Array(values.into()));
        self.set_reg(dst, Value::Object(array));
        Ok(())
    }

    fn op_array_get(&mut self) -> Result<(), String> {
        let dst = self.read_u8();
        let arr_reg = self.read_u8();
        let idx_reg = self.read_u8();
        let arr = self.reg(arr_reg);
        let idx_value = self.reg(idx_reg);
        let arr_obj = arr.as_object().ok_or_else(|| "Only arrays can be indexed.".to_string())?;
        let array = match arr_obj.kind() {
            ObjKind::Array(a) => a,
            _ => return Err("Only arrays can be indexed.".to_string()),
        };
        let idx = idx_value.as_number().ok_or_else(|| "Array index must be an integer.".to_string())?;
        if idx < 0.0 || idx != idx.trunc() {
            return Err("Array index must be an integer.".to_string());
        }
        let idx = idx as usize;
        let value = array.borrow().get(idx).copied().ok_or_else(|| "Array index out of range.".to_string())?;
        self.set_reg(dst, value);
        Ok(())
    }

    fn op_get_property(&mut self) -> Result<(), String> {
        let dst = self.read_u8();
        let obj_reg = self.read_u8();
        let name = self.read_constant();
        let name_ref = name.as_object().expect("property name constant must be a string");
        let obj_value = self.reg(obj_reg);
        let obj = obj_value.as_object().ok_or_else(|| "Only instances have properties.".to_string())?;
        let instance = match obj.kind() {
            ObjKind::Instance(i) => i,
            _ => return Err("Only instances have properties.".to_string()),
        };
        let found = {
            let fields = instance.fields.borrow();
            property_get(&fields, name_ref)
        };
        if let Some(value) = found {
            self.set_reg(dst, value);
            return Ok(());
        }
        let class_ref = instance.class;
        let method = match class_ref.kind() {
            ObjKind::Class(c) => {
                let methods = c.methods.borrow();
                property_get(&methods, name_ref)
            }
            _ => None,
        };
        match method {
            Some(method_value) => {
                let method_ref = method_value.as_object().expect("method table entries are functions");
                let bound = self.allocate(ObjKind::BoundMethod(ObjBoundMethod { receiver: obj_value, method: method_ref }));
                self.set_reg(dst, Value::Object(bound));
                Ok(())
            }
            None => Err(format!("Undefined property '{}'.", name_ref.as_str().unwrap_or("?"))),
        }
    }

    fn op_set_property(&mut self) -> Result<(), String> {
        let obj_reg = self.read_u8();
        let name = self.read_constant();
        let val_reg = self.read_u8();
        let name_ref = name.as_object().expect("property name constant must be a string");
        let obj_value = self.reg(obj_reg);
        let value = self.reg(val_reg);
        let obj = obj_value.as_object().ok_or_else(|| "Only instances have fields.".to_string())?;
        let instance = match obj.kind() {
            ObjKind::Instance(i) => i,
            _ => return Err("Only instances have fields.".to_string()),
        };
        let mut fields = instance.fields.borrow_mut();
        property_set(&mut fields, name_ref, value);
        Ok(())
    }

    fn op_invoke(&mut self) -> Result<(), String> {
        let dst = self.read_u8();
        let obj_reg = self.read_u8();
        let name = self.read_constant();
        let n = self.read_u8();
        let mut args = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let r = self.read_u8();
            args.push(self.reg(r));
        }
        let name_ref = name.as_object().expect("method name constant must be a string");
        let obj_value = self.reg(obj_reg);
        let obj = obj_value.as_object().ok_or_else(|| "Only instances support method invocation.".to_string())?;
        let instance = match obj.kind() {
            ObjKind::Instance(i) => i,
            _ => return Err("Only instances support method invocation.".to_string()),
        };

        let field_value = {
            let fields = instance.fields.borrow();
            property_get(&fields, name_ref)
        };
        if let Some(field_value) = field_value {
            return self.dispatch_call(field_value, &args, dst);
        }
        let class_ref = instance.class;
        let method = match class_ref.kind() {
            ObjKind::Class(c) => {
                let methods = c.methods.borrow();
                property_get(&methods, name_ref)
            }
            _ => None,
        };
        match method {
            Some(method_value) => self.call_bound(method_value, obj_value, &args, dst),
            None => Err(format!("Undefined property '{}'.", name_ref.as_str().unwrap_or("?"))),
        }
    }

    // --- call dispatch -------------------------------------------------------------

    /// Dispatches a `CALL`/`INVOKE`-style call over every callable value
    /// kind: plain functions, bound methods, and classes (construction).
    fn dispatch_call(&mut self, callee: Value, args: &[Value], dst: u8) -> Result<(), String> {
        let not_callable = "Attempted to call a non-function value.".to_string();
        let obj = match callee.as_object() {
            Some(o) => o,
            None => return Err(not_callable),
        };
        match obj.kind() {
            ObjKind::Function(_) => self.call_function(obj, args, dst, None),
            ObjKind::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.call_function(method, args, dst, Some(receiver))
            }
            ObjKind::Class(_) => self.call_class(obj, args, dst),
            _ => Err(not_callable),
        }
    }

    fn call_bound(&mut self, method: Value, receiver: Value, args: &[Value], dst: u8) -> Result<(), String> {
        let method_ref = method.as_object().expect("class methods table only holds functions");
        self.call_function(method_ref, args, dst, Some(receiver))
    }

    /// Pushes a new frame for `function`, marshalling `args` into its
    /// registers. `receiver`, when present, occupies register 0 (the
    /// method/constructor convention); the arity check accounts for it.
    fn call_function(&mut self, function: ObjRef, args: &[Value], dst: u8, receiver: Option<Value>) -> Result<(), String> {
        let f = function.as_function().ok_or_else(|| "Attempted to call a non-function value.".to_string())?;
        let expected_user_args = if receiver.is_some() { f.arity as usize - 1 } else { f.arity as usize };
        if args.len() != expected_user_args {
            return Err(format!("Expected {} arguments but got {}.", expected_user_args, args.len()));
        }

        let base = self.stack.len();
        self.stack.resize(base + f.register_count as usize, Value::Null);
        let mut slot = base;
        if let Some(receiver) = receiver {
            self.stack[slot] = receiver;
            slot += 1;
        }
        for &arg in args {
            self.stack[slot] = arg;
            slot += 1;
        }

        let dest = self.base() + dst as usize;
        self.frames.push(Frame::new(function, base, Some(dest)));
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, args: &[Value], dst: u8) -> Result<(), String> {
        let instance = self.allocate(ObjKind::Instance(ObjInstance { class, fields: Default::default() }));
        self.set_reg(dst, Value::Object(instance));

        let constructor = match class.kind() {
            ObjKind::Class(c) => {
                let methods = c.methods.borrow();
                property_get(&methods, self.constructor_name)
            }
            _ => unreachable!("call_class is only ever invoked with a Class object"),
        };
        match constructor {
            Some(ctor) => self.call_bound(ctor, Value::Object(instance), args, dst),
            None if args.is_empty() => Ok(()),
            None => {
                let name = match class.kind() {
                    ObjKind::Class(c) => c.name.as_str().unwrap_or("?").to_string(),
                    _ => unreachable!(),
                };
                Err(format!("Class '{}' has no constructor to accept arguments.", name))
            }
        }
    }

    fn global_name(&self, slot: usize) -> String {
        self.global_names.get(slot).and_then(|r| r.as_str()).unwrap_or("?").to_string()
    }
}
