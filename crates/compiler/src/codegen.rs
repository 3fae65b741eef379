//! x86-64 System V assembly generation (AT&T syntax).
//!
//! The generator walks the typed AST with a strict stack discipline:
//! every expression leaves its value in `%rax`, and the only hardware
//! stack traffic during expression evaluation goes through [`CodeGen::push`]
//! and [`CodeGen::pop`]. A depth counter tracks pushes against pops and is
//! asserted back to zero at every function boundary.
//!
//! Frame offsets are assigned here, just before emission: each local gets
//! the running frame size bumped by its own size and rounded up to its
//! alignment, negated; the final frame is rounded up to 16 bytes as the
//! ABI requires at call sites.

use crate::ast::{BinaryOp, Node, NodeKind, Obj, ObjKind, Program, expr_type};
use crate::error::CompileError;
use crate::types::{Type, TypeKind, align_to};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

const ARGREG8: [&str; 6] = ["%dil", "%sil", "%dl", "%cl", "%r8b", "%r9b"];
const ARGREG32: [&str; 6] = ["%edi", "%esi", "%edx", "%ecx", "%r8d", "%r9d"];
const ARGREG64: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

pub struct CodeGen {
    output: String,
    /// Logical stack depth in quadwords. Zero at function entry and exit.
    depth: usize,
    /// Monotonic counter behind `.L.else.N` and friends.
    label_count: usize,
    /// Name of the function being emitted, for its return label.
    current_fn: Option<String>,
    /// Input path; when set, `.file` and `.loc` directives are emitted so
    /// the assembler can build DWARF line tables.
    file: Option<String>,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            output: String::new(),
            depth: 0,
            label_count: 0,
            current_fn: None,
            file: None,
        }
    }

    /// Enable source location directives for the given input path.
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Lower a translation unit to assembly text.
    pub fn generate(mut self, prog: &Program) -> Result<String, CompileError> {
        if let Some(path) = &self.file {
            writeln!(self.output, ".file 1 \"{}\"", path)?;
        }
        self.assign_lvar_offsets(prog);
        self.emit_data(prog)?;
        self.emit_text(prog)?;
        Ok(self.output)
    }

    fn count(&mut self) -> usize {
        self.label_count += 1;
        self.label_count
    }

    fn push(&mut self) -> Result<(), CompileError> {
        writeln!(self.output, "  push %rax")?;
        self.depth += 1;
        Ok(())
    }

    fn pop(&mut self, arg: &str) -> Result<(), CompileError> {
        writeln!(self.output, "  pop {}", arg)?;
        self.depth -= 1;
        Ok(())
    }

    fn emit_loc(&mut self, node: &Node) -> Result<(), CompileError> {
        if self.file.is_some() {
            writeln!(self.output, "  .loc 1 {}", node.line)?;
        }
        Ok(())
    }

    /// Assign every local a negative frame offset and round each frame up
    /// to a multiple of 16.
    fn assign_lvar_offsets(&self, prog: &Program) {
        for obj in &prog.globals {
            let locals: Vec<Rc<RefCell<Obj>>> = match &obj.borrow().kind {
                ObjKind::Function {
                    locals,
                    body: Some(_),
                    ..
                } => locals.clone(),
                _ => continue,
            };

            let mut offset = 0usize;
            for local in &locals {
                let mut var = local.borrow_mut();
                offset += var.ty.size;
                offset = align_to(offset, var.ty.align);
                if let ObjKind::Local { offset: slot } = &mut var.kind {
                    *slot = -(offset as i32);
                }
            }

            if let ObjKind::Function { stack_size, .. } = &mut obj.borrow_mut().kind {
                *stack_size = align_to(offset, 16);
            }
        }
    }

    fn emit_data(&mut self, prog: &Program) -> Result<(), CompileError> {
        for obj in &prog.globals {
            let var = obj.borrow();
            let ObjKind::Global { init_data } = &var.kind else {
                continue;
            };

            writeln!(self.output, "  .data")?;
            writeln!(self.output, "  .global {}", var.name)?;
            writeln!(self.output, "{}:", var.name)?;

            match init_data {
                Some(bytes) => {
                    for i in 0..var.ty.size {
                        writeln!(self.output, "  .byte {}", bytes.get(i).copied().unwrap_or(0))?;
                    }
                }
                None => writeln!(self.output, "  .zero {}", var.ty.size)?,
            }
        }
        Ok(())
    }

    fn emit_text(&mut self, prog: &Program) -> Result<(), CompileError> {
        for obj in &prog.globals {
            let func = obj.borrow();
            let ObjKind::Function {
                params,
                body: Some(body),
                stack_size,
                ..
            } = &func.kind
            else {
                continue;
            };

            writeln!(self.output, "  .globl {}", func.name)?;
            writeln!(self.output, "  .text")?;
            writeln!(self.output, "{}:", func.name)?;
            self.current_fn = Some(func.name.clone());

            // Prologue
            writeln!(self.output, "  push %rbp")?;
            writeln!(self.output, "  mov %rsp, %rbp")?;
            writeln!(self.output, "  sub ${}, %rsp", stack_size)?;

            // Spill register-passed arguments into their frame slots.
            for (i, param) in params.iter().enumerate() {
                let param = param.borrow();
                let reg = match param.ty.size {
                    1 => ARGREG8[i],
                    4 => ARGREG32[i],
                    _ => ARGREG64[i],
                };
                writeln!(self.output, "  mov {}, {}(%rbp)", reg, param.offset())?;
            }

            self.gen_stmt(body)?;
            assert_eq!(self.depth, 0);

            // Epilogue; every return statement jumps here.
            writeln!(self.output, ".L.return.{}:", func.name)?;
            writeln!(self.output, "  mov %rbp, %rsp")?;
            writeln!(self.output, "  pop %rbp")?;
            writeln!(self.output, "  ret")?;
        }
        Ok(())
    }

    /// Emit the absolute address of a node into `%rax`.
    fn gen_addr(&mut self, node: &Node) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Var { obj } => {
                let var = obj.borrow();
                if var.is_local() {
                    writeln!(self.output, "  lea {}(%rbp), %rax", var.offset())?;
                } else {
                    writeln!(self.output, "  lea {}(%rip), %rax", var.name)?;
                }
                Ok(())
            }
            NodeKind::Deref { operand } => self.gen_expr(operand),
            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.gen_addr(rhs)
            }
            NodeKind::Member { base, member } => {
                self.gen_addr(base)?;
                writeln!(self.output, "  add ${}, %rax", member.offset)?;
                Ok(())
            }
            _ => Err(CompileError::at(node.loc, "not an lvalue")),
        }
    }

    /// Load the value `%rax` points at into `%rax`. Arrays, structs and
    /// unions cannot live in a register, so their "value" stays the
    /// address; this is where array-to-pointer decay happens.
    fn load(&mut self, ty: &Type) -> Result<(), CompileError> {
        if matches!(
            ty.kind,
            TypeKind::Array { .. } | TypeKind::Struct { .. } | TypeKind::Union { .. }
        ) {
            return Ok(());
        }

        match ty.size {
            1 => writeln!(self.output, "  movsbq (%rax), %rax")?,
            4 => writeln!(self.output, "  movsxd (%rax), %rax")?,
            _ => writeln!(self.output, "  mov (%rax), %rax")?,
        }
        Ok(())
    }

    /// Store `%rax` to the address on the logical stack top.
    fn store(&mut self, ty: &Type) -> Result<(), CompileError> {
        self.pop("%rdi")?;

        if matches!(ty.kind, TypeKind::Struct { .. } | TypeKind::Union { .. }) {
            for i in 0..ty.size {
                writeln!(self.output, "  mov {}(%rax), %r8b", i)?;
                writeln!(self.output, "  mov %r8b, {}(%rdi)", i)?;
            }
            return Ok(());
        }

        match ty.size {
            1 => writeln!(self.output, "  mov %al, (%rdi)")?,
            4 => writeln!(self.output, "  mov %eax, (%rdi)")?,
            _ => writeln!(self.output, "  mov %rax, (%rdi)")?,
        }
        Ok(())
    }

    /// Emit code that leaves the expression's value in `%rax`.
    fn gen_expr(&mut self, node: &Node) -> Result<(), CompileError> {
        self.emit_loc(node)?;

        match &node.kind {
            NodeKind::Num { value } => {
                writeln!(self.output, "  mov ${}, %rax", value)?;
                Ok(())
            }
            NodeKind::Neg { operand } => {
                self.gen_expr(operand)?;
                writeln!(self.output, "  neg %rax")?;
                Ok(())
            }
            NodeKind::Var { .. } | NodeKind::Member { .. } => {
                self.gen_addr(node)?;
                let ty = expr_type(node)?.clone();
                self.load(&ty)
            }
            NodeKind::Deref { operand } => {
                self.gen_expr(operand)?;
                let ty = expr_type(node)?.clone();
                self.load(&ty)
            }
            NodeKind::Addr { operand } => self.gen_addr(operand),
            NodeKind::Assign { lhs, rhs } => {
                self.gen_addr(lhs)?;
                self.push()?;
                self.gen_expr(rhs)?;
                let ty = expr_type(node)?.clone();
                self.store(&ty)
            }
            NodeKind::StmtExpr { body } => {
                for stmt in body {
                    self.gen_stmt(stmt)?;
                }
                Ok(())
            }
            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)
            }
            NodeKind::Funcall { name, args } => {
                for arg in args {
                    self.gen_expr(arg)?;
                    self.push()?;
                }
                for i in (0..args.len()).rev() {
                    self.pop(ARGREG64[i])?;
                }
                writeln!(self.output, "  mov $0, %rax")?;
                writeln!(self.output, "  call {}", name)?;
                Ok(())
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.gen_expr(rhs)?;
                self.push()?;
                self.gen_expr(lhs)?;
                self.pop("%rdi")?;

                match op {
                    BinaryOp::Add => writeln!(self.output, "  add %rdi, %rax")?,
                    BinaryOp::Sub => writeln!(self.output, "  sub %rdi, %rax")?,
                    BinaryOp::Mul => writeln!(self.output, "  imul %rdi, %rax")?,
                    BinaryOp::Div => {
                        writeln!(self.output, "  cqo")?;
                        writeln!(self.output, "  idiv %rdi")?;
                    }
                    BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
                        writeln!(self.output, "  cmp %rdi, %rax")?;
                        let set = match op {
                            BinaryOp::Eq => "sete",
                            BinaryOp::Ne => "setne",
                            BinaryOp::Lt => "setl",
                            _ => "setle",
                        };
                        writeln!(self.output, "  {} %al", set)?;
                        writeln!(self.output, "  movzb %al, %rax")?;
                    }
                }
                Ok(())
            }
            _ => Err(CompileError::at(node.loc, "invalid expression")),
        }
    }

    fn gen_stmt(&mut self, node: &Node) -> Result<(), CompileError> {
        self.emit_loc(node)?;

        match &node.kind {
            NodeKind::If { cond, then, els } => {
                let c = self.count();
                self.gen_expr(cond)?;
                writeln!(self.output, "  cmp $0, %rax")?;
                writeln!(self.output, "  je .L.else.{}", c)?;
                self.gen_stmt(then)?;
                writeln!(self.output, "  jmp .L.end.{}", c)?;
                writeln!(self.output, ".L.else.{}:", c)?;
                if let Some(els) = els {
                    self.gen_stmt(els)?;
                }
                writeln!(self.output, ".L.end.{}:", c)?;
                Ok(())
            }
            NodeKind::For {
                init,
                cond,
                inc,
                body,
            } => {
                let c = self.count();
                if let Some(init) = init {
                    self.gen_stmt(init)?;
                }
                writeln!(self.output, ".L.begin.{}:", c)?;
                if let Some(cond) = cond {
                    self.gen_expr(cond)?;
                    writeln!(self.output, "  cmp $0, %rax")?;
                    writeln!(self.output, "  je .L.end.{}", c)?;
                }
                self.gen_stmt(body)?;
                if let Some(inc) = inc {
                    self.gen_expr(inc)?;
                }
                writeln!(self.output, "  jmp .L.begin.{}", c)?;
                writeln!(self.output, ".L.end.{}:", c)?;
                Ok(())
            }
            NodeKind::Block { body } => {
                for stmt in body {
                    self.gen_stmt(stmt)?;
                }
                Ok(())
            }
            NodeKind::Return { value } => {
                self.gen_expr(value)?;
                let name = self
                    .current_fn
                    .clone()
                    .ok_or_else(|| CompileError::at(node.loc, "return outside of a function"))?;
                writeln!(self.output, "  jmp .L.return.{}", name)?;
                Ok(())
            }
            NodeKind::ExprStmt { expr } => self.gen_expr(expr),
            _ => Err(CompileError::at(node.loc, "invalid statement")),
        }
    }
}
