//! Walks the AST and emits register-machine bytecode.
//!
//! There is exactly one [`Compiler`] per program compile, shared across
//! every function/method body it visits; each body gets its own
//! [`FunctionState`] (locals, register high-water mark, its own `Chunk`).
//! The language has no closures, so a nested function's `FunctionState`
//! never looks at an enclosing one's locals — only the flat global table
//! and the heap (for interning constant strings) are shared.

use crate::common::error::CompileError;
use crate::common::span::Span;
use crate::compiler::ast::{BinOp, ClassDecl, Decl, Expr, FunctionDecl, MethodDecl, Program, Stmt, UnOp};
use crate::construct::chunk::Chunk;
use crate::construct::object::{ObjFunction, ObjKind, ObjRef};
use crate::construct::opcode::Opcode;
use crate::construct::value::Value;
use crate::gc::Heap;

use std::collections::{HashMap, HashSet};

/// The output of a full compile: the top-level script function, plus the
/// global slot table's names in slot order, so the VM can build a
/// `globals` vector indexed the same way `GetGlobal`/`SetGlobal` operands
/// are.
pub struct CompiledProgram {
    pub function: ObjRef,
    pub global_names: Vec<ObjRef>,
}

/// Compiles a complete program into its top-level function.
pub fn compile(heap: &Heap, program: Program) -> Result<CompiledProgram, CompileError> {
    let mut compiler = Compiler { heap, globals: GlobalTable::new() };
    let mut state = FunctionState::new(FunctionKind::Script);
    compiler.compile_decls(&mut state, program.declarations)?;
    compiler.finish_function(&mut state, 0)?;
    let function = ObjFunction {
        arity: 0,
        register_count: state.register_count as u8,
        chunk: state.chunk,
        name: None,
    };
    let function = heap.allocate(ObjKind::Function(function));
    let global_names = compiler.globals.ordered_names().into_iter().map(|name| heap.intern_string(&name)).collect();
    Ok(CompiledProgram { function, global_names })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct Local {
    name: String,
    depth: usize,
    register: u8,
    initialized: bool,
}

/// Compile-time bookkeeping for one function (or the top-level script)
/// body: its locals, its scope depth, and the register high-water mark
/// that becomes the compiled `ObjFunction::register_count`.
struct FunctionState {
    kind: FunctionKind,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: usize,
    /// Next free register — locals occupy a dense prefix `0..locals.len()`;
    /// everything from here up is the "compile-time stack" used to
    /// evaluate expressions, per §4.3's register allocation model.
    next_register: u16,
    register_count: u16,
    /// Only meaningful when `kind == Script`: the register holding the
    /// most recent depth-0 expression-statement's value, kept alive as the
    /// script's trailing result until superseded or discarded.
    pending: Option<u8>,
}

impl FunctionState {
    fn new(kind: FunctionKind) -> FunctionState {
        FunctionState {
            kind,
            chunk: Chunk::new(),
            locals: Vec::new(),
            scope_depth: 0,
            next_register: 0,
            register_count: 0,
            pending: None,
        }
    }
}

/// The flat table of script-level globals, shared by the whole compile.
/// `declared` tracks names introduced by an actual `let`/`function`/`class`
/// declaration (to catch redeclaration); `slots` assigns every name —
/// declared or merely referenced — a stable 16-bit slot the moment it's
/// first seen, so forward references still compile (and fail at *runtime*
/// if read before definition, per §4.3).
struct GlobalTable {
    slots: HashMap<String, u16>,
    declared: HashSet<String>,
}

impl GlobalTable {
    fn new() -> GlobalTable {
        GlobalTable { slots: HashMap::new(), declared: HashSet::new() }
    }

    fn slot_for(&mut self, name: &str) -> u16 {
        if let Some(&slot) = self.slots.get(name) {
            return slot;
        }
        let slot = self.slots.len() as u16;
        self.slots.insert(name.to_string(), slot);
        slot
    }

    /// Assigns (or reuses) a slot for a declaration, failing if this name
    /// was already declared as a global.
    fn declare(&mut self, name: &str) -> Result<u16, ()> {
        if !self.declared.insert(name.to_string()) {
            return Err(());
        }
        Ok(self.slot_for(name))
    }

    /// Names in slot order, for building the VM's `globals`/`global_names`
    /// vectors — every slot handed out by `slot_for` gets an entry here,
    /// whether or not the name was ever actually declared.
    fn ordered_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.slots.len()];
        for (name, &slot) in &self.slots {
            names[slot as usize] = name.clone();
        }
        names
    }
}

struct Compiler<'h> {
    heap: &'h Heap,
    globals: GlobalTable,
}

type CResult<T> = Result<T, CompileError>;

impl<'h> Compiler<'h> {
    fn err(&self, message: impl Into<String>, line: u32) -> CompileError {
        CompileError::new(message, Span::new(line))
    }

    fn reserve_register(&mut self, state: &mut FunctionState, line: u32) -> CResult<u8> {
        if state.next_register > u8::MAX as u16 {
            return Err(self.err("Too many registers needed; expression is too complex.", line));
        }
        let r = state.next_register as u8;
        state.next_register += 1;
        if state.next_register > state.register_count {
            state.register_count = state.next_register;
        }
        Ok(r)
    }

    fn release_to(&mut self, state: &mut FunctionState, target: u16) {
        state.next_register = target;
    }

    fn release_to_baseline(&mut self, state: &mut FunctionState) {
        let baseline = state.locals.len() as u16;
        state.next_register = baseline;
    }

    fn add_constant(&mut self, state: &mut FunctionState, value: Value, line: u32) -> CResult<u16> {
        state.chunk.add_constant(value).map_err(|msg| self.err(msg, line))
    }

    fn intern_const(&mut self, state: &mut FunctionState, text: &str, line: u32) -> CResult<u16> {
        let obj = self.heap.intern_string(text);
        self.add_constant(state, Value::Object(obj), line)
    }

    fn resolve_local(state: &FunctionState, name: &str) -> Option<usize> {
        state.locals.iter().rposition(|l| l.name == name)
    }

    fn emit_move(&self, state: &mut FunctionState, dst: u8, src: u8, line: u32) {
        if dst != src {
            state.chunk.write_op(Opcode::Move, line);
            state.chunk.write_byte(dst, line);
            state.chunk.write_byte(src, line);
        }
    }

    fn emit_load_null(&self, state: &mut FunctionState, dst: u8, line: u32) {
        state.chunk.write_op(Opcode::LoadNull, line);
        state.chunk.write_byte(dst, line);
    }

    /// Installs a freshly computed value already sitting in `reg` under
    /// `name`: a global declaration (`global_slot` is `Some`, assigned
    /// ahead of compiling the value so the declaration can refer to its own
    /// name for recursion) emits `DEFINE_GLOBAL`; otherwise records a new
    /// `Local` entry pointing at `reg`. `let`, `function`, and `class`
    /// declarations all route their final installation through this one
    /// path rather than each repeating the global-vs-local match.
    fn install_named_value(&mut self, state: &mut FunctionState, global_slot: Option<u16>, name: String, reg: u8, line: u32) {
        match global_slot {
            Some(slot) => {
                state.chunk.write_op(Opcode::DefineGlobal, line);
                state.chunk.write_byte(reg, line);
                state.chunk.write_u16(slot, line);
            }
            None => {
                state.locals.push(Local { name, depth: state.scope_depth, register: reg, initialized: true });
            }
        }
    }

    // --- declarations --------------------------------------------------------

    /// Compiles a sequence of declarations, tracking the pending trailing
    /// value when (and only when) this is the outermost script compiler at
    /// scope depth 0.
    fn compile_decls(&mut self, state: &mut FunctionState, decls: Vec<Decl>) -> CResult<()> {
        for decl in decls {
            let tracks_pending = state.kind == FunctionKind::Script && state.scope_depth == 0;
            if tracks_pending {
                if let Decl::Stmt(Stmt::Expr(expr)) = decl {
                    state.next_register = state.locals.len() as u16;
                    let reg = self.compile_expr(state, &expr)?;
                    state.pending = Some(reg);
                    continue;
                }
                state.pending = None;
            }
            self.compile_decl(state, decl)?;
        }
        Ok(())
    }

    fn compile_decl(&mut self, state: &mut FunctionState, decl: Decl) -> CResult<()> {
        match decl {
            Decl::Class(c) => self.compile_class(state, c),
            Decl::Function(f) => self.compile_function_decl(state, f),
            Decl::Let { name, init, line } => self.compile_let(state, name, init, line),
            Decl::Stmt(s) => self.compile_stmt(state, s),
        }
    }

    fn compile_let(&mut self, state: &mut FunctionState, name: String, init: Option<Expr>, line: u32) -> CResult<()> {
        let is_global = state.kind == FunctionKind::Script && state.scope_depth == 0;
        if is_global {
            let slot = self
                .globals
                .declare(&name)
                .map_err(|_| self.err(format!("Global '{}' is already declared.", name), line))?;
            let reg = match init {
                Some(expr) => self.compile_expr(state, &expr)?,
                None => {
                    let r = self.reserve_register(state, line)?;
                    self.emit_load_null(state, r, line);
                    r
                }
            };
            self.install_named_value(state, Some(slot), name, reg, line);
            self.release_to_baseline(state);
            return Ok(());
        }

        if state.locals.iter().any(|l| l.depth == state.scope_depth && l.name == name) {
            return Err(self.err(format!("Variable '{}' is already declared in this scope.", name), line));
        }
        let reg = self.reserve_register(state, line)?;
        state.locals.push(Local { name: name.clone(), depth: state.scope_depth, register: reg, initialized: false });
        match init {
            Some(expr) => {
                let value_reg = self.compile_expr(state, &expr)?;
                self.emit_move(state, reg, value_reg, line);
            }
            None => self.emit_load_null(state, reg, line),
        }
        state.locals.last_mut().unwrap().initialized = true;
        self.release_to_baseline(state);
        Ok(())
    }

    fn compile_function_decl(&mut self, state: &mut FunctionState, decl: FunctionDecl) -> CResult<()> {
        let is_global = state.kind == FunctionKind::Script && state.scope_depth == 0;
        let global_slot = if is_global {
            Some(
                self.globals
                    .declare(&decl.name)
                    .map_err(|_| self.err(format!("Global '{}' is already declared.", decl.name), decl.line))?,
            )
        } else {
            if state.locals.iter().any(|l| l.depth == state.scope_depth && l.name == decl.name) {
                return Err(self.err(format!("Variable '{}' is already declared in this scope.", decl.name), decl.line));
            }
            None
        };

        let function_obj =
            self.compile_function_body(FunctionKind::Function, Some(decl.name.clone()), decl.params, decl.body, decl.line)?;
        let const_idx = self.add_constant(state, Value::Object(function_obj), decl.line)?;
        let reg = self.reserve_register(state, decl.line)?;
        state.chunk.write_op(Opcode::LoadConst, decl.line);
        state.chunk.write_byte(reg, decl.line);
        state.chunk.write_u16(const_idx, decl.line);

        self.install_named_value(state, global_slot, decl.name, reg, decl.line);
        if is_global {
            self.release_to_baseline(state);
        }
        Ok(())
    }

    fn compile_class(&mut self, state: &mut FunctionState, decl: ClassDecl) -> CResult<()> {
        let is_global = state.kind == FunctionKind::Script && state.scope_depth == 0;
        let global_slot = if is_global {
            Some(
                self.globals
                    .declare(&decl.name)
                    .map_err(|_| self.err(format!("Global '{}' is already declared.", decl.name), decl.line))?,
            )
        } else {
            if state.locals.iter().any(|l| l.depth == state.scope_depth && l.name == decl.name) {
                return Err(self.err(format!("Variable '{}' is already declared in this scope.", decl.name), decl.line));
            }
            None
        };

        let name_const = self.intern_const(state, &decl.name, decl.line)?;
        let reg = self.reserve_register(state, decl.line)?;
        state.chunk.write_op(Opcode::Class, decl.line);
        state.chunk.write_byte(reg, decl.line);
        state.chunk.write_u16(name_const, decl.line);

        self.install_named_value(state, global_slot, decl.name.clone(), reg, decl.line);

        for method in decl.methods {
            self.compile_method(state, reg, method)?;
        }

        if is_global {
            self.release_to_baseline(state);
        }
        Ok(())
    }

    fn compile_method(&mut self, state: &mut FunctionState, class_reg: u8, method: MethodDecl) -> CResult<()> {
        let kind = if method.is_constructor { FunctionKind::Constructor } else { FunctionKind::Method };
        let method_obj = self.compile_function_body(kind, Some(method.name.clone()), method.params, method.body, method.line)?;
        let method_const = self.add_constant(state, Value::Object(method_obj), method.line)?;
        let method_reg = self.reserve_register(state, method.line)?;
        state.chunk.write_op(Opcode::LoadConst, method.line);
        state.chunk.write_byte(method_reg, method.line);
        state.chunk.write_u16(method_const, method.line);

        let name_const = self.intern_const(state, &method.name, method.line)?;
        state.chunk.write_op(Opcode::Method, method.line);
        state.chunk.write_byte(class_reg, method.line);
        state.chunk.write_u16(name_const, method.line);
        state.chunk.write_byte(method_reg, method.line);

        self.release_to(state, class_reg as u16 + 1);
        Ok(())
    }

    /// Compiles one function/method body into its own `ObjFunction`,
    /// running as a fresh [`FunctionState`] with no visibility into the
    /// enclosing one's locals.
    fn compile_function_body(
        &mut self,
        kind: FunctionKind,
        name: Option<String>,
        params: Vec<String>,
        body: Vec<Decl>,
        line: u32,
    ) -> CResult<ObjRef> {
        let mut state = FunctionState::new(kind);

        if matches!(kind, FunctionKind::Method | FunctionKind::Constructor) {
            let reg = self.reserve_register(&mut state, line)?;
            state.locals.push(Local { name: "this".to_string(), depth: 0, register: reg, initialized: true });
        }
        for param in &params {
            if state.locals.iter().any(|l| l.name == *param) {
                return Err(self.err(format!("Duplicate parameter name '{}'.", param), line));
            }
            let reg = self.reserve_register(&mut state, line)?;
            state.locals.push(Local { name: param.clone(), depth: 0, register: reg, initialized: true });
        }
        let arity = match kind {
            FunctionKind::Method | FunctionKind::Constructor => params.len() + 1,
            _ => params.len(),
        };
        if arity > u8::MAX as usize {
            return Err(self.err("Too many parameters.", line));
        }

        self.compile_decls(&mut state, body)?;
        self.finish_function(&mut state, line)?;

        let function = ObjFunction {
            arity: arity as u8,
            register_count: state.register_count as u8,
            chunk: state.chunk,
            name: name.map(|n| self.heap.intern_string(&n)),
        };
        Ok(self.heap.allocate(ObjKind::Function(function)))
    }

    /// Emits the implicit final `RETURN` every function ends with,
    /// regardless of whether an earlier explicit `return` already runs at
    /// execution time. Scripts return the pending trailing value (or
    /// `null`); constructors return the receiver; everything else returns
    /// `null`.
    fn finish_function(&mut self, state: &mut FunctionState, line: u32) -> CResult<()> {
        match state.kind {
            FunctionKind::Script => {
                let reg = match state.pending {
                    Some(r) => r,
                    None => {
                        let r = self.reserve_register(state, line)?;
                        self.emit_load_null(state, r, line);
                        r
                    }
                };
                state.chunk.write_op(Opcode::Return, line);
                state.chunk.write_byte(reg, line);
            }
            FunctionKind::Constructor => {
                state.chunk.write_op(Opcode::Return, line);
                state.chunk.write_byte(0, line);
            }
            FunctionKind::Function | FunctionKind::Method => {
                let r = self.reserve_register(state, line)?;
                self.emit_load_null(state, r, line);
                state.chunk.write_op(Opcode::Return, line);
                state.chunk.write_byte(r, line);
            }
        }
        Ok(())
    }

    // --- statements ------------------------------------------------------------

    fn compile_stmt(&mut self, state: &mut FunctionState, stmt: Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(state, &expr)?;
                self.release_to_baseline(state);
            }
            Stmt::Block(decls) => self.compile_block(state, decls)?,
            Stmt::If { cond, then_branch, else_branch } => self.compile_if(state, cond, then_branch, else_branch)?,
            Stmt::While { cond, body } => self.compile_while(state, cond, body)?,
            Stmt::Return { value, line } => self.compile_return(state, value, line)?,
        }
        Ok(())
    }

    fn compile_block(&mut self, state: &mut FunctionState, decls: Vec<Decl>) -> CResult<()> {
        state.scope_depth += 1;
        self.compile_decls(state, decls)?;
        state.scope_depth -= 1;
        state.locals.retain(|l| l.depth <= state.scope_depth);
        self.release_to_baseline(state);
        Ok(())
    }

    fn compile_if(
        &mut self,
        state: &mut FunctionState,
        cond: Expr,
        then_branch: Vec<Decl>,
        else_branch: Option<Vec<Decl>>,
    ) -> CResult<()> {
        let line = cond.line();
        let cond_reg = self.compile_expr(state, &cond)?;
        let jump_to_else = self.emit_jump_if_false(state, cond_reg, line);
        self.release_to_baseline(state);
        self.compile_block(state, then_branch)?;
        let jump_to_end = self.emit_jump(state, line);
        self.patch_jump(state, jump_to_else, line)?;
        if let Some(decls) = else_branch {
            self.compile_block(state, decls)?;
        }
        self.patch_jump(state, jump_to_end, line)?;
        Ok(())
    }

    fn compile_while(&mut self, state: &mut FunctionState, cond: Expr, body: Vec<Decl>) -> CResult<()> {
        let loop_start = state.chunk.code.len();
        let line = cond.line();
        let cond_reg = self.compile_expr(state, &cond)?;
        let jump_to_end = self.emit_jump_if_false(state, cond_reg, line);
        self.release_to_baseline(state);
        self.compile_block(state, body)?;
        self.emit_loop(state, loop_start, line)?;
        self.patch_jump(state, jump_to_end, line)?;
        Ok(())
    }

    fn compile_return(&mut self, state: &mut FunctionState, value: Option<Expr>, line: u32) -> CResult<()> {
        if state.kind == FunctionKind::Constructor && value.is_some() {
            return Err(self.err("Cannot return a value from a constructor.", line));
        }
        let reg = match value {
            Some(expr) => self.compile_expr(state, &expr)?,
            None => {
                let r = self.reserve_register(state, line)?;
                self.emit_load_null(state, r, line);
                r
            }
        };
        state.chunk.write_op(Opcode::Return, line);
        state.chunk.write_byte(reg, line);
        self.release_to_baseline(state);
        Ok(())
    }

    // --- jumps -----------------------------------------------------------------

    fn emit_jump_if_false(&mut self, state: &mut FunctionState, cond_reg: u8, line: u32) -> usize {
        state.chunk.write_op(Opcode::JumpIfFalse, line);
        state.chunk.write_byte(cond_reg, line);
        let at = state.chunk.code.len();
        state.chunk.write_u16(0xFFFF, line);
        at
    }

    fn emit_jump(&mut self, state: &mut FunctionState, line: u32) -> usize {
        state.chunk.write_op(Opcode::Jump, line);
        let at = state.chunk.code.len();
        state.chunk.write_u16(0xFFFF, line);
        at
    }

    fn patch_jump(&mut self, state: &mut FunctionState, at: usize, line: u32) -> CResult<()> {
        let target = state.chunk.code.len();
        let offset = target - (at + 2);
        if offset > u16::MAX as usize {
            return Err(self.err("Jump distance too large.", line));
        }
        state.chunk.patch_u16(at, offset as u16);
        Ok(())
    }

    fn emit_loop(&mut self, state: &mut FunctionState, loop_start: usize, line: u32) -> CResult<()> {
        state.chunk.write_op(Opcode::Loop, line);
        let at = state.chunk.code.len();
        let after = at + 2;
        let offset = after - loop_start;
        if offset > u16::MAX as usize {
            return Err(self.err("Loop distance too large.", line));
        }
        state.chunk.write_u16(offset as u16, line);
        Ok(())
    }

    // --- expressions -------------------------------------------------------------

    fn compile_expr(&mut self, state: &mut FunctionState, expr: &Expr) -> CResult<u8> {
        match expr {
            Expr::Number(n, line) => self.compile_constant_literal(state, Value::Number(*n), *line),
            Expr::Str(s, line) => {
                let obj = self.heap.intern_string(s);
                self.compile_constant_literal(state, Value::Object(obj), *line)
            }
            Expr::Bool(b, line) => self.compile_bool(state, *b, *line),
            Expr::Null(line) => {
                let dst = self.reserve_register(state, *line)?;
                self.emit_load_null(state, dst, *line);
                Ok(dst)
            }
            Expr::This(line) => self.compile_this(state, *line),
            Expr::Identifier(name, line) => self.compile_identifier_get(state, name, *line),
            Expr::Assign { target, value, line } => self.compile_assign(state, target, value, *line),
            Expr::Binary { op, left, right, line } => self.compile_binary(state, *op, left, right, *line),
            Expr::Unary { op, operand, line } => self.compile_unary(state, *op, operand, *line),
            Expr::Call { callee, args, line } => self.compile_call(state, callee, args, *line),
            Expr::Index { object, index, line } => self.compile_index(state, object, index, *line),
            Expr::Get { object, name, line } => self.compile_get(state, object, name, *line),
            Expr::Invoke { object, name, args, line } => self.compile_invoke(state, object, name, args, *line),
            Expr::Array { elements, line } => self.compile_array(state, elements, *line),
        }
    }

    fn compile_constant_literal(&mut self, state: &mut FunctionState, value: Value, line: u32) -> CResult<u8> {
        let idx = self.add_constant(state, value, line)?;
        let dst = self.reserve_register(state, line)?;
        state.chunk.write_op(Opcode::LoadConst, line);
        state.chunk.write_byte(dst, line);
        state.chunk.write_u16(idx, line);
        Ok(dst)
    }

    fn compile_bool(&mut self, state: &mut FunctionState, value: bool, line: u32) -> CResult<u8> {
        let dst = self.reserve_register(state, line)?;
        let op = if value { Opcode::LoadTrue } else { Opcode::LoadFalse };
        state.chunk.write_op(op, line);
        state.chunk.write_byte(dst, line);
        Ok(dst)
    }

    fn compile_this(&mut self, state: &mut FunctionState, line: u32) -> CResult<u8> {
        match Self::resolve_local(state, "this") {
            Some(idx) => {
                let src = state.locals[idx].register;
                let dst = self.reserve_register(state, line)?;
                self.emit_move(state, dst, src, line);
                Ok(dst)
            }
            None => Err(self.err("Cannot use 'this' outside of a method.", line)),
        }
    }

    fn compile_identifier_get(&mut self, state: &mut FunctionState, name: &str, line: u32) -> CResult<u8> {
        if let Some(idx) = Self::resolve_local(state, name) {
            if !state.locals[idx].initialized {
                return Err(self.err(format!("Cannot read local variable '{}' before it is initialized.", name), line));
            }
            let src = state.locals[idx].register;
            let dst = self.reserve_register(state, line)?;
            self.emit_move(state, dst, src, line);
            return Ok(dst);
        }
        let slot = self.globals.slot_for(name);
        let dst = self.reserve_register(state, line)?;
        state.chunk.write_op(Opcode::GetGlobal, line);
        state.chunk.write_byte(dst, line);
        state.chunk.write_u16(slot, line);
        Ok(dst)
    }

    fn compile_assign(&mut self, state: &mut FunctionState, target: &Expr, value: &Expr, line: u32) -> CResult<u8> {
        match target {
            Expr::Identifier(name, _) => {
                if let Some(idx) = Self::resolve_local(state, name) {
                    let local_reg = state.locals[idx].register;
                    let value_reg = self.compile_expr(state, value)?;
                    self.emit_move(state, local_reg, value_reg, line);
                    Ok(value_reg)
                } else {
                    let slot = self.globals.slot_for(name);
                    let value_reg = self.compile_expr(state, value)?;
                    state.chunk.write_op(Opcode::SetGlobal, line);
                    state.chunk.write_byte(value_reg, line);
                    state.chunk.write_u16(slot, line);
                    Ok(value_reg)
                }
            }
            Expr::Get { object, name, .. } => {
                let object_reg = self.compile_expr(state, object)?;
                let value_reg = self.compile_expr(state, value)?;
                let name_const = self.intern_const(state, name, line)?;
                state.chunk.write_op(Opcode::SetProperty, line);
                state.chunk.write_byte(object_reg, line);
                state.chunk.write_u16(name_const, line);
                state.chunk.write_byte(value_reg, line);
                self.release_to(state, value_reg as u16 + 1);
                Ok(value_reg)
            }
            _ => unreachable!("parser only ever produces Identifier/Get assignment targets"),
        }
    }

    fn compile_binary(&mut self, state: &mut FunctionState, op: BinOp, left: &Expr, right: &Expr, line: u32) -> CResult<u8> {
        let left_reg = self.compile_expr(state, left)?;
        let right_reg = self.compile_expr(state, right)?;
        let dst = left_reg;
        match op {
            BinOp::Add => self.emit_binop(state, Opcode::Add, dst, left_reg, right_reg, line),
            BinOp::Sub => self.emit_binop(state, Opcode::Sub, dst, left_reg, right_reg, line),
            BinOp::Mul => self.emit_binop(state, Opcode::Mul, dst, left_reg, right_reg, line),
            BinOp::Div => self.emit_binop(state, Opcode::Div, dst, left_reg, right_reg, line),
            BinOp::Gt => self.emit_binop(state, Opcode::Gt, dst, left_reg, right_reg, line),
            BinOp::Lt => self.emit_binop(state, Opcode::Lt, dst, left_reg, right_reg, line),
            BinOp::Eq => self.emit_binop(state, Opcode::Eq, dst, left_reg, right_reg, line),
            // No dedicated opcodes for !=, >=, <=: compile via EQ/LT/GT plus NOT,
            // the same trick clox-style compilers use to keep the opcode set small.
            BinOp::Ne => {
                self.emit_binop(state, Opcode::Eq, dst, left_reg, right_reg, line);
                self.emit_unop(state, Opcode::Not, dst, dst, line);
            }
            BinOp::Ge => {
                self.emit_binop(state, Opcode::Lt, dst, left_reg, right_reg, line);
                self.emit_unop(state, Opcode::Not, dst, dst, line);
            }
            BinOp::Le => {
                self.emit_binop(state, Opcode::Gt, dst, left_reg, right_reg, line);
                self.emit_unop(state, Opcode::Not, dst, dst, line);
            }
        }
        self.release_to(state, left_reg as u16 + 1);
        Ok(dst)
    }

    fn emit_binop(&mut self, state: &mut FunctionState, op: Opcode, dst: u8, a: u8, b: u8, line: u32) {
        state.chunk.write_op(op, line);
        state.chunk.write_byte(dst, line);
        state.chunk.write_byte(a, line);
        state.chunk.write_byte(b, line);
    }

    fn emit_unop(&mut self, state: &mut FunctionState, op: Opcode, dst: u8, a: u8, line: u32) {
        state.chunk.write_op(op, line);
        state.chunk.write_byte(dst, line);
        state.chunk.write_byte(a, line);
    }

    fn compile_unary(&mut self, state: &mut FunctionState, op: UnOp, operand: &Expr, line: u32) -> CResult<u8> {
        let reg = self.compile_expr(state, operand)?;
        let opcode = match op {
            UnOp::Neg => Opcode::Neg,
            UnOp::Not => Opcode::Not,
        };
        self.emit_unop(state, opcode, reg, reg, line);
        Ok(reg)
    }

    fn compile_call(&mut self, state: &mut FunctionState, callee: &Expr, args: &[Expr], line: u32) -> CResult<u8> {
        let callee_reg = self.compile_expr(state, callee)?;
        let mut arg_regs = Vec::with_capacity(args.len());
        for arg in args {
            arg_regs.push(self.compile_expr(state, arg)?);
        }
        state.chunk.write_op(Opcode::Call, line);
        state.chunk.write_byte(callee_reg, line);
        state.chunk.write_byte(callee_reg, line);
        state.chunk.write_byte(arg_regs.len() as u8, line);
        for r in arg_regs {
            state.chunk.write_byte(r, line);
        }
        self.release_to(state, callee_reg as u16 + 1);
        Ok(callee_reg)
    }

    fn compile_index(&mut self, state: &mut FunctionState, object: &Expr, index: &Expr, line: u32) -> CResult<u8> {
        let object_reg = self.compile_expr(state, object)?;
        let index_reg = self.compile_expr(state, index)?;
        state.chunk.write_op(Opcode::ArrayGet, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_byte(index_reg, line);
        self.release_to(state, object_reg as u16 + 1);
        Ok(object_reg)
    }

    fn compile_get(&mut self, state: &mut FunctionState, object: &Expr, name: &str, line: u32) -> CResult<u8> {
        let object_reg = self.compile_expr(state, object)?;
        let name_const = self.intern_const(state, name, line)?;
        state.chunk.write_op(Opcode::GetProperty, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_u16(name_const, line);
        Ok(object_reg)
    }

    fn compile_invoke(&mut self, state: &mut FunctionState, object: &Expr, name: &str, args: &[Expr], line: u32) -> CResult<u8> {
        let object_reg = self.compile_expr(state, object)?;
        let name_const = self.intern_const(state, name, line)?;
        let mut arg_regs = Vec::with_capacity(args.len());
        for arg in args {
            arg_regs.push(self.compile_expr(state, arg)?);
        }
        state.chunk.write_op(Opcode::Invoke, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_byte(object_reg, line);
        state.chunk.write_u16(name_const, line);
        state.chunk.write_byte(arg_regs.len() as u8, line);
        for r in arg_regs {
            state.chunk.write_byte(r, line);
        }
        self.release_to(state, object_reg as u16 + 1);
        Ok(object_reg)
    }

    fn compile_array(&mut self, state: &mut FunctionState, elements: &[Expr], line: u32) -> CResult<u8> {
        let mut regs = Vec::with_capacity(elements.len());
        for element in elements {
            regs.push(self.compile_expr(state, element)?);
        }
        let dst = match regs.first() {
            Some(&first) => first,
            None => self.reserve_register(state, line)?,
        };
        state.chunk.write_op(Opcode::BuildArray, line);
        state.chunk.write_byte(dst, line);
        state.chunk.write_byte(regs.len() as u8, line);
        for r in &regs {
            state.chunk.write_byte(*r, line);
        }
        self.release_to(state, dst as u16 + 1);
        Ok(dst)
    }
}
