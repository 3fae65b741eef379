//! Recursive-descent parser: token stream to a typed AST.
//!
//! Grammar (one token of lookahead):
//!
//! ```text
//! program       = ( typedef | function-def | global-var )*
//! function-def  = declspec declarator "{" compound-stmt
//! global-var    = declspec declarator ( "," declarator )* ";"
//! declspec      = ( "void" | "char" | "short" | "int" | "long"
//!                 | "typedef" | struct-decl | union-decl | typedef-name )+
//! declarator    = "*"* ( "(" declarator ")" | ident ) type-suffix
//! type-suffix   = "(" func-params | "[" num "]" type-suffix | ε
//! compound-stmt = ( typedef | declaration | stmt )* "}"
//! declaration   = declspec ( declarator ("=" expr)?
//!                 ( "," declarator ("=" expr)? )* )? ";"
//! stmt          = "return" expr ";" | "if" "(" expr ")" stmt ("else" stmt)?
//!               | "for" "(" expr-stmt expr? ";" expr? ")" stmt
//!               | "while" "(" expr ")" stmt | "{" compound-stmt | expr-stmt
//! expr-stmt     = expr? ";"
//! expr          = assign ( "," expr )?
//! assign        = equality ( "=" assign )?
//! equality      = relational ( ("=="|"!=") relational )*
//! relational    = add ( ("<"|"<="|">"|">=") add )*
//! add           = mul ( ("+"|"-") mul )*
//! mul           = unary ( ("*"|"/") unary )*
//! unary         = ("+"|"-"|"*"|"&") unary | postfix
//! postfix       = primary ( "[" expr "]" | "." ident | "->" ident )*
//! primary       = "(" "{" stmt+ "}" ")" | "(" expr ")"
//!               | "sizeof" ( "(" type-name ")" | unary )
//!               | ident ( "(" args? ")" )? | str | num
//! ```
//!
//! The parser owns all per-compilation state: the token cursor, the scope
//! stack, the locals of the function being parsed, the collected globals
//! and the counter behind anonymous string-literal names. `+` and `-` are
//! rewritten at parse time so pointer arithmetic comes out pre-scaled, and
//! `sizeof` folds to an integer literal here as well.

use crate::ast::{BinaryOp, Node, NodeKind, Obj, ObjKind, Program, expr_type};
use crate::error::CompileError;
use crate::lexer::{Token, TokenKind};
use crate::types::{
    Member, Param, Type, TypeKind, add_type, array_of, copy_type, func_type, pointer_to,
    struct_of, ty_char, ty_int, ty_long, ty_short, ty_void, union_of,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// What an identifier resolves to inside a lexical frame.
#[derive(Debug, Clone)]
pub enum ScopeEntry {
    Var(Rc<RefCell<Obj>>),
    TypeDef(Rc<Type>),
}

/// One lexical frame. Variables/typedefs and struct/union tags live in
/// separate namespaces.
#[derive(Debug, Default)]
struct Scope {
    vars: HashMap<String, ScopeEntry>,
    tags: HashMap<String, Rc<Type>>,
}

/// Storage-class flags collected by `declspec`.
#[derive(Debug, Default)]
struct VarAttr {
    is_typedef: bool,
}

pub struct Parser<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
    /// Innermost frame last; the first frame is the file scope.
    scopes: Vec<Scope>,
    /// Locals of the function currently being parsed, in declaration order.
    locals: Vec<Rc<RefCell<Obj>>>,
    globals: Vec<Rc<RefCell<Obj>>>,
    /// Counter behind `.L..<n>` string-literal names.
    unique_id: usize,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, tokens: &'a [Token]) -> Parser<'a> {
        Parser {
            src,
            tokens,
            pos: 0,
            scopes: vec![Scope::default()],
            locals: Vec::new(),
            globals: Vec::new(),
            unique_id: 0,
        }
    }

    /// Parse a whole translation unit.
    pub fn parse(&mut self) -> Result<Program, CompileError> {
        while self.tok().kind != TokenKind::Eof {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            if attr.is_typedef {
                self.parse_typedef(basety)?;
                continue;
            }

            if self.is_function_ahead()? {
                self.function(basety)?;
            } else {
                self.global_variable(basety)?;
            }
        }
        Ok(Program {
            globals: std::mem::take(&mut self.globals),
        })
    }

    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn tok(&self) -> &Token {
        &self.tokens[self.pos]
    }

    /// Lookahead without moving; clamped to the end-of-input sentinel.
    fn nth(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn text_of(&self, tok: &Token) -> &'a str {
        tok.text(self.src)
    }

    fn tok_is(&self, tok: &Token, op: &str) -> bool {
        self.text_of(tok) == op
    }

    /// Does the current token spell `op`? Pure query, never advances.
    fn equal(&self, op: &str) -> bool {
        self.tok_is(self.tok(), op)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    /// Advance past `op` or fail.
    fn skip(&mut self, op: &str) -> Result<(), CompileError> {
        if !self.equal(op) {
            return Err(CompileError::at(
                self.tok().loc,
                format!("expected '{}'", op),
            ));
        }
        self.advance();
        Ok(())
    }

    /// Advance past `op` if it is the current token.
    fn consume(&mut self, op: &str) -> bool {
        if self.equal(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn node_at(&self, idx: usize, kind: NodeKind) -> Node {
        let tok = &self.tokens[idx];
        Node::new(kind, tok.loc, tok.line)
    }

    fn ident_name(&self, idx: usize) -> Result<String, CompileError> {
        let tok = &self.tokens[idx];
        if tok.kind != TokenKind::Ident {
            return Err(CompileError::at(tok.loc, "expected an identifier"));
        }
        Ok(self.text_of(tok).to_string())
    }

    fn get_number(&self) -> Result<i64, CompileError> {
        match self.tok().kind {
            TokenKind::Num(value) => Ok(value),
            _ => Err(CompileError::at(self.tok().loc, "expected a number")),
        }
    }

    // ------------------------------------------------------------------
    // Scopes and objects
    // ------------------------------------------------------------------

    fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    fn innermost(&mut self) -> &mut Scope {
        // The file scope seeded in `new` is never popped.
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    fn push_var_scope(&mut self, name: String, entry: ScopeEntry) {
        self.innermost().vars.insert(name, entry);
    }

    fn push_tag_scope(&mut self, name: String, ty: Rc<Type>) {
        self.innermost().tags.insert(name, ty);
    }

    /// Look an identifier up, innermost frame first.
    fn find_var(&self, name: &str) -> Option<ScopeEntry> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name).cloned())
    }

    fn find_tag(&self, name: &str) -> Option<Rc<Type>> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.tags.get(name).cloned())
    }

    fn find_typedef(&self, tok: &Token) -> Option<Rc<Type>> {
        if tok.kind != TokenKind::Ident {
            return None;
        }
        match self.find_var(self.text_of(tok)) {
            Some(ScopeEntry::TypeDef(ty)) => Some(ty),
            _ => None,
        }
    }

    fn new_lvar(&mut self, name: String, ty: Rc<Type>) -> Rc<RefCell<Obj>> {
        let var = Rc::new(RefCell::new(Obj {
            name: name.clone(),
            ty,
            kind: ObjKind::Local { offset: 0 },
        }));
        self.locals.push(var.clone());
        self.push_var_scope(name, ScopeEntry::Var(var.clone()));
        var
    }

    fn new_gvar(&mut self, name: String, ty: Rc<Type>) -> Rc<RefCell<Obj>> {
        let var = Rc::new(RefCell::new(Obj {
            name: name.clone(),
            ty,
            kind: ObjKind::Global { init_data: None },
        }));
        self.globals.push(var.clone());
        self.push_var_scope(name, ScopeEntry::Var(var.clone()));
        var
    }

    fn new_unique_name(&mut self) -> String {
        let name = format!(".L..{}", self.unique_id);
        self.unique_id += 1;
        name
    }

    /// String literals become anonymous globals carrying their decoded
    /// bytes as initialization data.
    fn new_string_literal(&mut self, bytes: Vec<u8>, ty: Rc<Type>) -> Rc<RefCell<Obj>> {
        let name = self.new_unique_name();
        let var = Rc::new(RefCell::new(Obj {
            name,
            ty,
            kind: ObjKind::Global {
                init_data: Some(bytes),
            },
        }));
        self.globals.push(var.clone());
        var
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Is this token the start of a type name? Consults the fixed keyword
    /// set and the typedefs in scope.
    fn is_typename(&self, tok: &Token) -> bool {
        const TYPE_KEYWORDS: &[&str] = &[
            "void", "char", "short", "int", "long", "struct", "union", "typedef",
        ];
        if TYPE_KEYWORDS.contains(&self.text_of(tok)) {
            return true;
        }
        self.find_typedef(tok).is_some()
    }

    /// Parse declaration specifiers into a base type.
    ///
    /// The order of type keywords is free, so `long int` and `int long`
    /// mean the same thing. Each keyword bumps a counter in its own bit
    /// range and the accumulated value maps back to a type; combinations
    /// with no mapping are rejected. `struct`, `union` and typedef names
    /// do not combine with the arithmetic keywords at all. `typedef` is a
    /// storage class and is reported through `attr` instead of
    /// contributing to the type.
    fn declspec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<Rc<Type>, CompileError> {
        const VOID: u32 = 1 << 0;
        const CHAR: u32 = 1 << 2;
        const SHORT: u32 = 1 << 4;
        const INT: u32 = 1 << 6;
        const LONG: u32 = 1 << 8;
        const OTHER: u32 = 1 << 10;

        let mut ty = ty_int();
        let mut counter = 0u32;

        while self.is_typename(self.tok()) {
            if self.equal("typedef") {
                let loc = self.tok().loc;
                match attr.as_deref_mut() {
                    Some(attr) => attr.is_typedef = true,
                    None => {
                        return Err(CompileError::at(
                            loc,
                            "storage class specifier is not allowed in this context",
                        ));
                    }
                }
                self.advance();
                continue;
            }

            let typedef_ty = self.find_typedef(self.tok());
            if self.equal("struct") || self.equal("union") || typedef_ty.is_some() {
                if counter > 0 {
                    break;
                }
                if self.equal("struct") {
                    self.advance();
                    ty = self.struct_decl()?;
                } else if self.equal("union") {
                    self.advance();
                    ty = self.union_decl()?;
                } else if let Some(typedef_ty) = typedef_ty {
                    ty = typedef_ty;
                    self.advance();
                }
                counter += OTHER;
                continue;
            }

            let loc = self.tok().loc;
            counter += match self.text_of(self.tok()) {
                "void" => VOID,
                "char" => CHAR,
                "short" => SHORT,
                "int" => INT,
                "long" => LONG,
                _ => return Err(CompileError::at(loc, "invalid type")),
            };

            ty = match counter {
                VOID => ty_void(),
                CHAR => ty_char(),
                c if c == SHORT || c == SHORT + INT => ty_short(),
                INT => ty_int(),
                c if c == LONG || c == LONG + INT => ty_long(),
                _ => return Err(CompileError::at(loc, "invalid type")),
            };
            self.advance();
        }

        Ok(ty)
    }

    /// Parse a declarator around `ty`, returning the full type and the
    /// index of the name token.
    ///
    /// Suffixes bind tighter than the grouping parentheses, so the group
    /// is scanned once with a throwaway base type just to find its extent,
    /// the suffix is applied to the outer type, and the group is then
    /// re-parsed around the suffixed type. `int (*p)[3]` therefore comes
    /// out as pointer-to-array, not array-of-pointer.
    fn declarator(&mut self, mut ty: Rc<Type>) -> Result<(Rc<Type>, usize), CompileError> {
        while self.consume("*") {
            ty = pointer_to(ty);
        }

        if self.equal("(") {
            let group_start = self.pos;
            self.advance();
            self.declarator(ty_int())?;
            self.skip(")")?;
            let ty = self.type_suffix(ty)?;
            let after_suffix = self.pos;
            self.pos = group_start + 1;
            let result = self.declarator(ty)?;
            self.pos = after_suffix;
            return Ok(result);
        }

        if self.tok().kind != TokenKind::Ident {
            return Err(CompileError::at(self.tok().loc, "expected a variable name"));
        }
        let name_idx = self.pos;
        self.advance();
        let ty = self.type_suffix(ty)?;
        Ok((ty, name_idx))
    }

    /// A declarator with no name, used by `sizeof(type-name)`.
    fn abstract_declarator(&mut self, mut ty: Rc<Type>) -> Result<Rc<Type>, CompileError> {
        while self.consume("*") {
            ty = pointer_to(ty);
        }

        if self.equal("(") {
            let group_start = self.pos;
            self.advance();
            self.abstract_declarator(ty_int())?;
            self.skip(")")?;
            let ty = self.type_suffix(ty)?;
            let after_suffix = self.pos;
            self.pos = group_start + 1;
            let result = self.abstract_declarator(ty)?;
            self.pos = after_suffix;
            return Ok(result);
        }

        self.type_suffix(ty)
    }

    fn typename(&mut self) -> Result<Rc<Type>, CompileError> {
        let basety = self.declspec(None)?;
        self.abstract_declarator(basety)
    }

    fn type_suffix(&mut self, ty: Rc<Type>) -> Result<Rc<Type>, CompileError> {
        if self.equal("(") {
            self.advance();
            return self.func_params(ty);
        }

        if self.equal("[") {
            self.advance();
            let len = self.get_number()?;
            self.advance();
            self.skip("]")?;
            let ty = self.type_suffix(ty)?;
            return Ok(array_of(ty, len as usize));
        }

        Ok(ty)
    }

    fn func_params(&mut self, return_ty: Rc<Type>) -> Result<Rc<Type>, CompileError> {
        let mut params = Vec::new();
        while !self.equal(")") {
            if !params.is_empty() {
                self.skip(",")?;
            }
            let basety = self.declspec(None)?;
            let (ty, name_idx) = self.declarator(basety)?;
            params.push(Param {
                name: self.ident_name(name_idx)?,
                ty: Rc::new(copy_type(&ty)),
            });
        }
        self.advance(); // ")"
        Ok(func_type(return_ty, params))
    }

    /// `struct` has been consumed; parse an optional tag and an optional
    /// member list. A tag without a body refers back to a tag in scope.
    fn struct_decl(&mut self) -> Result<Rc<Type>, CompileError> {
        let mut tag = None;
        if self.tok().kind == TokenKind::Ident {
            tag = Some(self.pos);
            self.advance();
        }

        if let Some(tag_idx) = tag
            && !self.equal("{")
        {
            let loc = self.tokens[tag_idx].loc;
            let name = self.text_of(&self.tokens[tag_idx]);
            return self
                .find_tag(name)
                .ok_or_else(|| CompileError::at(loc, "unknown struct type"));
        }

        self.skip("{")?;
        let ty = struct_of(self.struct_members()?);
        if let Some(tag_idx) = tag {
            let name = self.text_of(&self.tokens[tag_idx]).to_string();
            self.push_tag_scope(name, ty.clone());
        }
        Ok(ty)
    }

    fn union_decl(&mut self) -> Result<Rc<Type>, CompileError> {
        let mut tag = None;
        if self.tok().kind == TokenKind::Ident {
            tag = Some(self.pos);
            self.advance();
        }

        if let Some(tag_idx) = tag
            && !self.equal("{")
        {
            let loc = self.tokens[tag_idx].loc;
            let name = self.text_of(&self.tokens[tag_idx]);
            return self
                .find_tag(name)
                .ok_or_else(|| CompileError::at(loc, "unknown union type"));
        }

        self.skip("{")?;
        let ty = union_of(self.struct_members()?);
        if let Some(tag_idx) = tag {
            let name = self.text_of(&self.tokens[tag_idx]).to_string();
            self.push_tag_scope(name, ty.clone());
        }
        Ok(ty)
    }

    /// Member list of a struct or union, up to and including the `}`.
    /// Offsets are filled in by the layout constructors.
    fn struct_members(&mut self) -> Result<Vec<Member>, CompileError> {
        let mut members = Vec::new();
        while !self.equal("}") {
            if self.tok().kind == TokenKind::Eof {
                return Err(CompileError::at(self.tok().loc, "expected '}'"));
            }
            let basety = self.declspec(None)?;
            let mut first = true;
            while !self.consume(";") {
                if !first {
                    self.skip(",")?;
                }
                first = false;
                let (ty, name_idx) = self.declarator(basety.clone())?;
                members.push(Member {
                    name: self.ident_name(name_idx)?,
                    ty,
                    offset: 0,
                });
            }
        }
        self.advance(); // "}"
        Ok(members)
    }

    /// Record typedef names in the variable namespace of the innermost
    /// scope.
    fn parse_typedef(&mut self, basety: Rc<Type>) -> Result<(), CompileError> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;
            let (ty, name_idx) = self.declarator(basety.clone())?;
            let name = self.ident_name(name_idx)?;
            self.push_var_scope(name, ScopeEntry::TypeDef(ty));
        }
        Ok(())
    }

    /// Local declaration list. Initializers lower to assignments wrapped
    /// in expression statements, collected into one block.
    fn declaration(&mut self, basety: Rc<Type>) -> Result<Node, CompileError> {
        let mut body = Vec::new();
        let mut first = true;

        while !self.equal(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            let (ty, name_idx) = self.declarator(basety.clone())?;
            if matches!(ty.kind, TypeKind::Void) {
                return Err(CompileError::at(
                    self.tokens[name_idx].loc,
                    "variable declared void",
                ));
            }
            let name = self.ident_name(name_idx)?;
            let var = self.new_lvar(name, ty);

            if !self.equal("=") {
                continue;
            }
            let assign_idx = self.pos;
            self.advance();
            let lhs = self.node_at(name_idx, NodeKind::Var { obj: var });
            let rhs = self.assign()?;
            let assign = self.node_at(
                assign_idx,
                NodeKind::Assign {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
            body.push(self.node_at(
                assign_idx,
                NodeKind::ExprStmt {
                    expr: Box::new(assign),
                },
            ));
        }

        let end_idx = self.pos;
        self.advance(); // ";"
        Ok(self.node_at(end_idx, NodeKind::Block { body }))
    }

    /// Peek whether the upcoming declarator names a function. The
    /// declarator is parsed once with a throwaway base type and the
    /// cursor is restored.
    fn is_function_ahead(&mut self) -> Result<bool, CompileError> {
        if self.equal(";") {
            return Ok(false);
        }
        let save = self.pos;
        let result = self.declarator(ty_int());
        self.pos = save;
        let (ty, _) = result?;
        Ok(ty.is_function())
    }

    /// Function definition or declaration. A `;` right after the
    /// declarator makes it a declaration, which emits no code.
    fn function(&mut self, basety: Rc<Type>) -> Result<(), CompileError> {
        let (ty, name_idx) = self.declarator(basety)?;
        let name = self.ident_name(name_idx)?;

        let params_spec = match &ty.kind {
            TypeKind::Func { params, .. } => params.clone(),
            _ => {
                return Err(CompileError::at(
                    self.tokens[name_idx].loc,
                    "expected a function",
                ));
            }
        };

        let fn_obj = Rc::new(RefCell::new(Obj {
            name: name.clone(),
            ty: ty.clone(),
            kind: ObjKind::Function {
                params: Vec::new(),
                locals: Vec::new(),
                body: None,
                stack_size: 0,
            },
        }));
        self.globals.push(fn_obj.clone());
        self.push_var_scope(name, ScopeEntry::Var(fn_obj.clone()));

        if self.consume(";") {
            return Ok(());
        }

        self.locals = Vec::new();
        self.enter_scope();

        // Parameters become the first locals, in declaration order.
        let mut params = Vec::new();
        for param in &params_spec {
            params.push(self.new_lvar(param.name.clone(), param.ty.clone()));
        }

        let brace_idx = self.pos;
        self.skip("{")?;
        let body = self.compound_stmt(brace_idx)?;
        let locals = std::mem::take(&mut self.locals);
        self.leave_scope();

        fn_obj.borrow_mut().kind = ObjKind::Function {
            params,
            locals,
            body: Some(body),
            stack_size: 0,
        };
        Ok(())
    }

    fn global_variable(&mut self, basety: Rc<Type>) -> Result<(), CompileError> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;
            let (ty, name_idx) = self.declarator(basety.clone())?;
            let name = self.ident_name(name_idx)?;
            self.new_gvar(name, ty);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Body of a `{ ... }` block. `start_idx` is the opening brace, which
    /// the caller has already consumed. Each statement is type-annotated
    /// as soon as it is parsed.
    fn compound_stmt(&mut self, start_idx: usize) -> Result<Node, CompileError> {
        self.enter_scope();
        let mut body = Vec::new();

        while !self.equal("}") {
            if self.tok().kind == TokenKind::Eof {
                return Err(CompileError::at(self.tok().loc, "expected '}'"));
            }

            let mut node = if self.is_typename(self.tok()) {
                let mut attr = VarAttr::default();
                let basety = self.declspec(Some(&mut attr))?;
                if attr.is_typedef {
                    self.parse_typedef(basety)?;
                    continue;
                }
                self.declaration(basety)?
            } else {
                self.stmt()?
            };
            add_type(&mut node)?;
            body.push(node);
        }

        self.leave_scope();
        self.advance(); // "}"
        Ok(self.node_at(start_idx, NodeKind::Block { body }))
    }

    fn stmt(&mut self) -> Result<Node, CompileError> {
        let start_idx = self.pos;

        if self.equal("return") {
            self.advance();
            let value = self.expr()?;
            self.skip(";")?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Return {
                    value: Box::new(value),
                },
            ));
        }

        if self.equal("if") {
            self.advance();
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;
            let then = self.stmt()?;
            let els = if self.equal("else") {
                self.advance();
                Some(Box::new(self.stmt()?))
            } else {
                None
            };
            return Ok(self.node_at(
                start_idx,
                NodeKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    els,
                },
            ));
        }

        if self.equal("for") {
            self.advance();
            self.skip("(")?;
            let init = self.expr_stmt()?;
            let cond = if !self.equal(";") {
                Some(Box::new(self.expr()?))
            } else {
                None
            };
            self.skip(";")?;
            let inc = if !self.equal(")") {
                Some(Box::new(self.expr()?))
            } else {
                None
            };
            self.skip(")")?;
            let body = self.stmt()?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::For {
                    init: Some(Box::new(init)),
                    cond,
                    inc,
                    body: Box::new(body),
                },
            ));
        }

        if self.equal("while") {
            self.advance();
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;
            let body = self.stmt()?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::For {
                    init: None,
                    cond: Some(Box::new(cond)),
                    inc: None,
                    body: Box::new(body),
                },
            ));
        }

        if self.equal("{") {
            self.advance();
            return self.compound_stmt(start_idx);
        }

        self.expr_stmt()
    }

    fn expr_stmt(&mut self) -> Result<Node, CompileError> {
        let start_idx = self.pos;
        if self.consume(";") {
            return Ok(self.node_at(start_idx, NodeKind::Block { body: Vec::new() }));
        }
        let expr = self.expr()?;
        self.skip(";")?;
        Ok(self.node_at(
            start_idx,
            NodeKind::ExprStmt {
                expr: Box::new(expr),
            },
        ))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<Node, CompileError> {
        let node = self.assign()?;
        if self.equal(",") {
            let op_idx = self.pos;
            self.advance();
            let rhs = self.expr()?;
            return Ok(self.node_at(
                op_idx,
                NodeKind::Comma {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
            ));
        }
        Ok(node)
    }

    fn assign(&mut self) -> Result<Node, CompileError> {
        let node = self.equality()?;
        if self.equal("=") {
            let op_idx = self.pos;
            self.advance();
            let rhs = self.assign()?;
            return Ok(self.node_at(
                op_idx,
                NodeKind::Assign {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
            ));
        }
        Ok(node)
    }

    fn binary(&self, op_idx: usize, op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        self.node_at(
            op_idx,
            NodeKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        )
    }

    fn equality(&mut self) -> Result<Node, CompileError> {
        let mut node = self.relational()?;
        loop {
            let op_idx = self.pos;
            if self.consume("==") {
                let rhs = self.relational()?;
                node = self.binary(op_idx, BinaryOp::Eq, node, rhs);
                continue;
            }
            if self.consume("!=") {
                let rhs = self.relational()?;
                node = self.binary(op_idx, BinaryOp::Ne, node, rhs);
                continue;
            }
            return Ok(node);
        }
    }

    fn relational(&mut self) -> Result<Node, CompileError> {
        let mut node = self.add()?;
        loop {
            let op_idx = self.pos;
            if self.consume("<") {
                let rhs = self.add()?;
                node = self.binary(op_idx, BinaryOp::Lt, node, rhs);
                continue;
            }
            if self.consume("<=") {
                let rhs = self.add()?;
                node = self.binary(op_idx, BinaryOp::Le, node, rhs);
                continue;
            }
            // a > b and a >= b swap operands instead of having their own
            // node kinds.
            if self.consume(">") {
                let rhs = self.add()?;
                node = self.binary(op_idx, BinaryOp::Lt, rhs, node);
                continue;
            }
            if self.consume(">=") {
                let rhs = self.add()?;
                node = self.binary(op_idx, BinaryOp::Le, rhs, node);
                continue;
            }
            return Ok(node);
        }
    }

    fn add(&mut self) -> Result<Node, CompileError> {
        let mut node = self.mul()?;
        loop {
            let op_idx = self.pos;
            if self.consume("+") {
                let rhs = self.mul()?;
                node = self.new_add(node, rhs, op_idx)?;
                continue;
            }
            if self.consume("-") {
                let rhs = self.mul()?;
                node = self.new_sub(node, rhs, op_idx)?;
                continue;
            }
            return Ok(node);
        }
    }

    /// `+` is overloaded for pointer arithmetic: adding an integer to a
    /// pointer moves it by that many elements, so the integer operand is
    /// scaled by the element size before the add. `num + ptr` is
    /// canonicalized to `ptr + num` first; `ptr + ptr` is meaningless.
    fn new_add(&self, mut lhs: Node, mut rhs: Node, op_idx: usize) -> Result<Node, CompileError> {
        add_type(&mut lhs)?;
        add_type(&mut rhs)?;
        let lhs_ty = expr_type(&lhs)?.clone();
        let rhs_ty = expr_type(&rhs)?.clone();

        if lhs_ty.is_integer() && rhs_ty.is_integer() {
            return Ok(self.binary(op_idx, BinaryOp::Add, lhs, rhs));
        }

        if lhs_ty.is_pointer_like() && rhs_ty.is_pointer_like() {
            return Err(CompileError::at(self.tokens[op_idx].loc, "invalid operands"));
        }

        let (ptr, num, scale) = if let Some(base) = lhs_ty.base() {
            (lhs, rhs, base.size)
        } else if let Some(base) = rhs_ty.base() {
            (rhs, lhs, base.size)
        } else {
            return Err(CompileError::at(self.tokens[op_idx].loc, "invalid operands"));
        };

        let scaled = self.binary(
            op_idx,
            BinaryOp::Mul,
            num,
            self.node_at(op_idx, NodeKind::Num { value: scale as i64 }),
        );
        Ok(self.binary(op_idx, BinaryOp::Add, ptr, scaled))
    }

    /// `-` is overloaded the same way. `ptr - int` scales the integer;
    /// `ptr - ptr` yields the number of elements between the two, so the
    /// byte difference is divided back down by the element size.
    fn new_sub(&self, mut lhs: Node, mut rhs: Node, op_idx: usize) -> Result<Node, CompileError> {
        add_type(&mut lhs)?;
        add_type(&mut rhs)?;
        let lhs_ty = expr_type(&lhs)?.clone();
        let rhs_ty = expr_type(&rhs)?.clone();
        let (loc, line) = (self.tokens[op_idx].loc, self.tokens[op_idx].line);

        if lhs_ty.is_integer() && rhs_ty.is_integer() {
            return Ok(self.binary(op_idx, BinaryOp::Sub, lhs, rhs));
        }

        if let Some(base) = lhs_ty.base() {
            if rhs_ty.is_integer() {
                let scale = base.size;
                let mut scaled = self.binary(
                    op_idx,
                    BinaryOp::Mul,
                    rhs,
                    self.node_at(op_idx, NodeKind::Num { value: scale as i64 }),
                );
                add_type(&mut scaled)?;
                return Ok(Node::with_type(
                    NodeKind::Binary {
                        op: BinaryOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(scaled),
                    },
                    loc,
                    line,
                    lhs_ty,
                ));
            }

            if rhs_ty.is_pointer_like() {
                let scale = base.size;
                let diff = Node::with_type(
                    NodeKind::Binary {
                        op: BinaryOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    loc,
                    line,
                    ty_int(),
                );
                return Ok(self.binary(
                    op_idx,
                    BinaryOp::Div,
                    diff,
                    self.node_at(op_idx, NodeKind::Num { value: scale as i64 }),
                ));
            }
        }

        Err(CompileError::at(loc, "invalid operands"))
    }

    fn mul(&mut self) -> Result<Node, CompileError> {
        let mut node = self.unary()?;
        loop {
            let op_idx = self.pos;
            if self.consume("*") {
                let rhs = self.unary()?;
                node = self.binary(op_idx, BinaryOp::Mul, node, rhs);
                continue;
            }
            if self.consume("/") {
                let rhs = self.unary()?;
                node = self.binary(op_idx, BinaryOp::Div, node, rhs);
                continue;
            }
            return Ok(node);
        }
    }

    fn unary(&mut self) -> Result<Node, CompileError> {
        let start_idx = self.pos;

        if self.consume("+") {
            return self.unary();
        }
        if self.consume("-") {
            let operand = self.unary()?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Neg {
                    operand: Box::new(operand),
                },
            ));
        }
        if self.consume("&") {
            let operand = self.unary()?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Addr {
                    operand: Box::new(operand),
                },
            ));
        }
        if self.consume("*") {
            let operand = self.unary()?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Deref {
                    operand: Box::new(operand),
                },
            ));
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node, CompileError> {
        let mut node = self.primary()?;
        loop {
            let op_idx = self.pos;

            if self.consume("[") {
                // a[b] is *(a + b)
                let index = self.expr()?;
                self.skip("]")?;
                let sum = self.new_add(node, index, op_idx)?;
                node = self.node_at(
                    op_idx,
                    NodeKind::Deref {
                        operand: Box::new(sum),
                    },
                );
                continue;
            }

            if self.consume(".") {
                node = self.struct_ref(node)?;
                continue;
            }

            if self.consume("->") {
                // x->y is (*x).y
                node = self.node_at(
                    op_idx,
                    NodeKind::Deref {
                        operand: Box::new(node),
                    },
                );
                node = self.struct_ref(node)?;
                continue;
            }

            return Ok(node);
        }
    }

    /// Member selection; the current token is the member name. Lookup is
    /// by name over the record's member list, resolved here so the code
    /// generator only sees offsets.
    fn struct_ref(&mut self, mut base: Node) -> Result<Node, CompileError> {
        add_type(&mut base)?;
        let base_ty = expr_type(&base)?.clone();
        let members = base_ty
            .members()
            .ok_or_else(|| CompileError::at(base.loc, "not a struct nor a union"))?;

        let member_idx = self.pos;
        let name = self.ident_name(member_idx)?;
        self.advance();

        let member = members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| CompileError::at(self.tokens[member_idx].loc, "no such member"))?
            .clone();

        Ok(self.node_at(
            member_idx,
            NodeKind::Member {
                base: Box::new(base),
                member,
            },
        ))
    }

    fn funcall(&mut self) -> Result<Node, CompileError> {
        let start_idx = self.pos;
        let name = self.text_of(self.tok()).to_string();
        self.advance(); // name
        self.advance(); // "("

        let mut args = Vec::new();
        while !self.equal(")") {
            if !args.is_empty() {
                self.skip(",")?;
            }
            args.push(self.assign()?);
        }
        self.skip(")")?;
        Ok(self.node_at(start_idx, NodeKind::Funcall { name, args }))
    }

    fn primary(&mut self) -> Result<Node, CompileError> {
        let start_idx = self.pos;

        // GNU statement expression
        if self.equal("(") && self.tok_is(self.nth(1), "{") {
            self.advance();
            self.advance();
            let block = self.compound_stmt(start_idx)?;
            self.skip(")")?;
            let body = match block.kind {
                NodeKind::Block { body } => body,
                _ => Vec::new(),
            };
            return Ok(self.node_at(start_idx, NodeKind::StmtExpr { body }));
        }

        if self.consume("(") {
            let node = self.expr()?;
            self.skip(")")?;
            return Ok(node);
        }

        // sizeof folds to a constant at parse time, either from a type
        // name or from the annotated type of its operand.
        if self.equal("sizeof") && self.tok_is(self.nth(1), "(") && self.is_typename(self.nth(2)) {
            self.advance();
            self.advance();
            let ty = self.typename()?;
            self.skip(")")?;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Num {
                    value: ty.size as i64,
                },
            ));
        }

        if self.equal("sizeof") {
            self.advance();
            let mut operand = self.unary()?;
            add_type(&mut operand)?;
            let size = expr_type(&operand)?.size;
            return Ok(self.node_at(
                start_idx,
                NodeKind::Num {
                    value: size as i64,
                },
            ));
        }

        if self.tok().kind == TokenKind::Ident {
            if self.tok_is(self.nth(1), "(") {
                return self.funcall();
            }

            let name = self.text_of(self.tok());
            match self.find_var(name) {
                Some(ScopeEntry::Var(obj)) => {
                    let node = self.node_at(start_idx, NodeKind::Var { obj });
                    self.advance();
                    return Ok(node);
                }
                _ => {
                    return Err(CompileError::at(self.tok().loc, "undefined variable"));
                }
            }
        }

        if let TokenKind::Str { bytes, ty } = &self.tok().kind {
            let bytes = bytes.clone();
            let ty = ty.clone();
            let var = self.new_string_literal(bytes, ty);
            let node = self.node_at(start_idx, NodeKind::Var { obj: var });
            self.advance();
            return Ok(node);
        }

        if let TokenKind::Num(value) = &self.tok().kind {
            let value = *value;
            let node = self.node_at(start_idx, NodeKind::Num { value });
            self.advance();
            return Ok(node);
        }

        Err(CompileError::at(self.tok().loc, "expected an expression"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_source(src: &str) -> Result<Program, CompileError> {
        let tokens = tokenize(src)?;
        Parser::new(src, &tokens).parse()
    }

    fn parse_err(src: &str) -> String {
        parse_source(src).unwrap_err().to_string()
    }

    fn find_fn(program: &Program, name: &str) -> Rc<RefCell<Obj>> {
        program
            .globals
            .iter()
            .find(|o| o.borrow().name == name && o.borrow().is_function())
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_parse_minimal_program() {
        let program = parse_source("int main() { return 0; }").unwrap();
        assert_eq!(program.globals.len(), 1);
        let main = find_fn(&program, "main");
        assert!(main.borrow().is_function());
    }

    #[test]
    fn test_locals_are_collected_in_declaration_order() {
        let program = parse_source("int main() { int a; char b; long c; return 0; }").unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function { locals, .. } = &main.kind else {
            panic!("main is not a function");
        };
        let names: Vec<String> = locals.iter().map(|l| l.borrow().name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(locals.iter().all(|l| l.borrow().is_local()));
    }

    #[test]
    fn test_params_become_locals() {
        let program = parse_source("int add2(int x, int y) { return x + y; }").unwrap();
        let func = find_fn(&program, "add2");
        let func = func.borrow();
        let ObjKind::Function { params, locals, .. } = &func.kind else {
            panic!("not a function");
        };
        assert_eq!(params.len(), 2);
        assert_eq!(locals.len(), 2);
        assert_eq!(params[0].borrow().name, "x");
    }

    #[test]
    fn test_every_node_carries_its_token() {
        fn check(node: &Node) {
            assert!(node.line >= 1);
            match &node.kind {
                NodeKind::Binary { lhs, rhs, .. }
                | NodeKind::Assign { lhs, rhs }
                | NodeKind::Comma { lhs, rhs } => {
                    check(lhs);
                    check(rhs);
                }
                NodeKind::Neg { operand }
                | NodeKind::Addr { operand }
                | NodeKind::Deref { operand } => check(operand),
                NodeKind::Block { body } | NodeKind::StmtExpr { body } => {
                    body.iter().for_each(check)
                }
                NodeKind::Return { value } => check(value),
                NodeKind::ExprStmt { expr } => check(expr),
                _ => {}
            }
        }

        let program = parse_source("int main() {\n  int a = 2;\n  return a * 3;\n}").unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function {
            body: Some(body), ..
        } = &main.kind
        else {
            panic!("main has no body");
        };
        check(body);
    }

    #[test]
    fn test_expressions_are_typed_and_statements_are_not() {
        fn check(node: &Node) {
            match &node.kind {
                NodeKind::Block { body } | NodeKind::StmtExpr { body } => {
                    body.iter().for_each(check)
                }
                NodeKind::If { cond, then, els } => {
                    check(cond);
                    check(then);
                    if let Some(els) = els {
                        check(els);
                    }
                }
                NodeKind::Return { value } => check(value),
                NodeKind::ExprStmt { expr } => check(expr),
                NodeKind::Binary { lhs, rhs, .. }
                | NodeKind::Assign { lhs, rhs }
                | NodeKind::Comma { lhs, rhs } => {
                    check(lhs);
                    check(rhs);
                }
                NodeKind::Neg { operand }
                | NodeKind::Addr { operand }
                | NodeKind::Deref { operand } => check(operand),
                _ => {}
            }
            let is_stmt = matches!(
                node.kind,
                NodeKind::Block { .. }
                    | NodeKind::If { .. }
                    | NodeKind::For { .. }
                    | NodeKind::Return { .. }
                    | NodeKind::ExprStmt { .. }
            );
            assert_eq!(node.ty.is_none(), is_stmt, "bad annotation at {:?}", node.kind);
        }

        let program = parse_source(
            "int main() { int x; int *p; p = &x; *p = 1 + 2 * 3; if (x < 4) return x; return *p; }",
        )
        .unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function {
            body: Some(body), ..
        } = &main.kind
        else {
            panic!("main has no body");
        };
        check(body);
    }

    #[test]
    fn test_sizeof_folds_at_parse_time() {
        let program = parse_source(
            "int main() { int x[4]; return sizeof(x) + sizeof(long) + sizeof(int *); }",
        )
        .unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function {
            body: Some(body), ..
        } = &main.kind
        else {
            panic!("main has no body");
        };

        // Collect the literal values: 16 (int[4]), 8 (long), 8 (int *).
        fn nums(node: &Node, out: &mut Vec<i64>) {
            match &node.kind {
                NodeKind::Num { value } => out.push(*value),
                NodeKind::Binary { lhs, rhs, .. } => {
                    nums(lhs, out);
                    nums(rhs, out);
                }
                NodeKind::Block { body } => body.iter().for_each(|n| nums(n, out)),
                NodeKind::Return { value } => nums(value, out),
                NodeKind::ExprStmt { expr } => nums(expr, out),
                _ => {}
            }
        }
        let mut values = Vec::new();
        nums(body, &mut values);
        assert_eq!(values, vec![16, 8, 8]);
    }

    #[test]
    fn test_grouped_declarator_is_pointer_to_array() {
        let program = parse_source("int main() { int (*p)[3]; return sizeof(p) + sizeof(*p); }")
            .unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function { locals, .. } = &main.kind else {
            panic!("not a function");
        };
        let p = locals[0].borrow();
        // pointer (8 bytes) to array of 3 ints (12 bytes)
        assert_eq!(p.ty.size, 8);
        assert_eq!(p.ty.base().unwrap().size, 12);
        assert!(matches!(
            p.ty.base().unwrap().kind,
            TypeKind::Array { len: 3, .. }
        ));
    }

    #[test]
    fn test_array_declarator_without_grouping() {
        let program = parse_source("int main() { int *p[3]; return 0; }").unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function { locals, .. } = &main.kind else {
            panic!("not a function");
        };
        // array of 3 pointers
        let p = locals[0].borrow();
        assert_eq!(p.ty.size, 24);
        assert!(matches!(p.ty.kind, TypeKind::Array { len: 3, .. }));
    }

    #[test]
    fn test_long_int_orderings_agree() {
        let program =
            parse_source("int main() { long int a; int long b; return sizeof(a) + sizeof(b); }")
                .unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function { locals, .. } = &main.kind else {
            panic!("not a function");
        };
        assert_eq!(locals[0].borrow().ty.size, 8);
        assert_eq!(locals[1].borrow().ty.size, 8);
    }

    #[test]
    fn test_pointer_add_is_scaled() {
        // p + 1 on an int pointer multiplies the index by 4.
        let program = parse_source("int main() { int x[2]; int *p; p = x; return *(p + 1); }");
        assert!(program.is_ok());
    }

    #[test]
    fn test_typedef_names_resolve() {
        let program = parse_source(
            "typedef int myint; typedef myint *intp;\nint main() { myint a; intp p; p = &a; return *p; }",
        );
        assert!(program.is_ok());
    }

    #[test]
    fn test_typedef_is_scoped() {
        // The inner block shadows the typedef with a variable.
        let program = parse_source(
            "typedef int t;\nint main() { t x; { int t; t = 3; } return x; }",
        );
        assert!(program.is_ok());
    }

    #[test]
    fn test_struct_tags_live_in_their_own_namespace() {
        let program = parse_source(
            "struct tag { int a; };\nint main() { int tag; struct tag s; s.a = 1; tag = 2; return s.a + tag; }",
        );
        assert!(program.is_ok());
    }

    #[test]
    fn test_string_literal_becomes_anonymous_global() {
        let program = parse_source("int main() { return \"ab\"[0]; }").unwrap();
        let lit = program
            .globals
            .iter()
            .find(|o| o.borrow().name.starts_with(".L.."))
            .cloned()
            .unwrap();
        let lit = lit.borrow();
        assert_eq!(lit.ty.size, 3);
        match &lit.kind {
            ObjKind::Global {
                init_data: Some(bytes),
            } => assert_eq!(bytes, b"ab"),
            other => panic!("expected initialized global, got {:?}", other),
        }
    }

    #[test]
    fn test_function_declaration_has_no_body() {
        let program = parse_source("int helper();\nint main() { return helper(); }").unwrap();
        let helper = find_fn(&program, "helper");
        let helper = helper.borrow();
        let ObjKind::Function { body, .. } = &helper.kind else {
            panic!("not a function");
        };
        assert!(body.is_none());
    }

    #[test]
    fn test_shadowing_keeps_outer_binding() {
        let program = parse_source(
            "int main() { int x; x = 1; { int x; x = 2; } return x; }",
        )
        .unwrap();
        let main = find_fn(&program, "main");
        let main = main.borrow();
        let ObjKind::Function { locals, .. } = &main.kind else {
            panic!("not a function");
        };
        // Both declarations exist as distinct objects.
        assert_eq!(locals.len(), 2);
    }

    #[test]
    fn test_undefined_variable() {
        assert_eq!(parse_err("int main() { return x; }"), "undefined variable");
    }

    #[test]
    fn test_pointer_plus_pointer_is_rejected() {
        assert_eq!(
            parse_err("int main() { int *p; int *q; return p + q; }"),
            "invalid operands"
        );
    }

    #[test]
    fn test_missing_semicolon() {
        assert_eq!(parse_err("int main() { return 1 }"), "expected ';'");
    }

    #[test]
    fn test_missing_expression() {
        assert_eq!(parse_err("int main() { return 1+; }"), "expected an expression");
    }

    #[test]
    fn test_invalid_type_combination() {
        assert_eq!(parse_err("int main() { int char x; return 0; }"), "invalid type");
    }

    #[test]
    fn test_void_variable_is_rejected() {
        assert_eq!(
            parse_err("int main() { void x; return 0; }"),
            "variable declared void"
        );
    }

    #[test]
    fn test_unknown_struct_tag() {
        assert_eq!(
            parse_err("int main() { struct nope s; return 0; }"),
            "unknown struct type"
        );
    }

    #[test]
    fn test_missing_member() {
        assert_eq!(
            parse_err("struct t { int a; }; int main() { struct t s; return s.b; }"),
            "no such member"
        );
    }

    #[test]
    fn test_member_access_on_non_aggregate() {
        assert_eq!(
            parse_err("int main() { int x; return x.a; }"),
            "not a struct nor a union"
        );
    }

    #[test]
    fn test_missing_declarator_name() {
        assert_eq!(
            parse_err("int main() { int *; return 0; }"),
            "expected a variable name"
        );
    }

    #[test]
    fn test_storage_class_rejected_in_struct_member() {
        assert_eq!(
            parse_err("struct t { typedef int a; };"),
            "storage class specifier is not allowed in this context"
        );
    }
}
