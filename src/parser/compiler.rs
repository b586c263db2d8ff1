//! Code generator: lowers a checked AST to an [`Object`]

use super::ast::*;
use super::checker::{CheckedProgram, MetricInfo, metric_index};
use super::error::{ErrorKind, ErrorList, ParseError};
use super::lexer::Span;
use crate::constant_pool::{RegexPool, StringPool};
use crate::opcodes::{Instr, Opcode, Operand};
use crate::program::{MetricDesc, Object};
use crate::store::ValueType;

/// Jump target placeholder, patched once the label is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

/// Compiler that translates a checked AST to VM bytecode
pub struct Compiler {
    name: String,
    program: Vec<Instr>,
    strings: StringPool,
    regexps: RegexPool,
    metrics: Vec<MetricInfo>,
    /// Bound address of each label
    labels: Vec<Option<usize>>,
    /// (pc, label) of every jump awaiting its target
    fixups: Vec<(usize, Label)>,
    /// Zero-based source line of the node being compiled
    line: u32,
    errors: ErrorList,
}

impl Compiler {
    pub fn new(name: &str) -> Self {
        Compiler {
            name: name.to_string(),
            program: Vec::new(),
            strings: StringPool::new(),
            regexps: RegexPool::new(),
            metrics: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            line: 0,
            errors: ErrorList::new(name),
        }
    }

    /// Compile a checked program into an Object
    pub fn compile(mut self, checked: CheckedProgram) -> Result<Object, ErrorList> {
        self.metrics = checked.metrics;

        for stmt in &checked.ast.statements {
            self.compile_stmt(stmt);
        }
        self.backpatch();

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let metrics = self
            .metrics
            .iter()
            .map(|m| MetricDesc {
                name: m.decl.name.clone(),
                exported_name: m.decl.export_name().to_string(),
                kind: m.decl.kind,
                value_type: m.value_type,
                keys: m.decl.keys.clone(),
                buckets: m.decl.buckets.clone(),
                limit: m.decl.limit,
                hidden: m.decl.hidden,
            })
            .collect();

        Ok(Object {
            name: self.name,
            program: self.program,
            strings: self.strings.into_vec(),
            regexps: self.regexps.into_vec(),
            metrics,
        })
    }

    // ===== Emission =====

    fn emit(&mut self, opcode: Opcode) {
        self.emit_with(opcode, Operand::None);
    }

    fn emit_with(&mut self, opcode: Opcode, operand: Operand) {
        self.program.push(Instr::new(opcode, operand, self.line));
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.program.len());
    }

    fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        self.fixups.push((self.program.len(), label));
        self.emit_with(opcode, Operand::Int(-1));
    }

    fn backpatch(&mut self) {
        for (pc, label) in std::mem::take(&mut self.fixups) {
            match self.labels[label.0] {
                Some(target) => self.program[pc].operand = Operand::Int(target as i64),
                None => self.internal_error("jump to unbound label", Span::default()),
            }
        }
    }

    fn at(&mut self, span: Span) {
        self.line = span.start.line.saturating_sub(1) as u32;
    }

    fn internal_error(&mut self, message: &str, span: Span) {
        self.errors.push(ParseError::with_kind(
            ErrorKind::Other,
            format!("internal compiler error: {}", message),
            span,
        ));
    }

    fn regex(&mut self, source: &str, span: Span) -> usize {
        match self.regexps.intern(source) {
            Ok(index) => index,
            Err(err) => {
                self.errors.push(ParseError::with_kind(
                    ErrorKind::InvalidExpression,
                    format!("Invalid regular expression /{}/: {}", source, err),
                    span,
                ));
                0
            }
        }
    }

    // ===== Statements =====

    fn compile_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.compile_stmt(stmt);
        }
    }

    fn compile_stmt(&mut self, stmt: &AstStmt) {
        self.at(stmt.span());
        match stmt {
            AstStmt::Decl(_) | AstStmt::Const { .. } | AstStmt::DecoDef { .. } => {}

            AstStmt::Cond {
                cond,
                then,
                else_branch,
                ..
            } => {
                self.compile_expr(cond);
                let otherwise = self.new_label();
                self.emit_jump(Opcode::Jnm, otherwise);
                self.emit_with(Opcode::Setmatched, Operand::Bool(false));
                self.compile_block(then);
                self.emit_with(Opcode::Setmatched, Operand::Bool(true));
                match else_branch {
                    Some(else_branch) => {
                        let end = self.new_label();
                        self.emit_jump(Opcode::Jmp, end);
                        self.bind(otherwise);
                        self.compile_block(else_branch);
                        self.bind(end);
                    }
                    None => self.bind(otherwise),
                }
            }

            AstStmt::Otherwise { body, .. } => {
                self.emit(Opcode::Otherwise);
                let end = self.new_label();
                self.emit_jump(Opcode::Jnm, end);
                self.emit_with(Opcode::Setmatched, Operand::Bool(false));
                self.compile_block(body);
                self.emit_with(Opcode::Setmatched, Operand::Bool(true));
                self.bind(end);
            }

            AstStmt::Deco { expanded, span, .. } => match expanded {
                Some(block) => self.compile_block(block),
                None => self.internal_error("decorator was not expanded", *span),
            },

            AstStmt::Next { span } => self.internal_error("stray `next`", *span),

            AstStmt::Stop { .. } => self.emit(Opcode::Stop),

            AstStmt::Del { target, expiry, span } => {
                if let Some(expiry) = expiry {
                    self.emit_with(Opcode::Push, Operand::Duration(*expiry));
                }
                let Some(keys) = self.compile_metric_ref(target, *span) else {
                    return;
                };
                let opcode = if expiry.is_some() { Opcode::Expire } else { Opcode::Del };
                self.emit_with(opcode, Operand::Int(keys as i64));
            }

            AstStmt::Expr(expr) => self.compile_expr(expr),
        }
    }

    /// `keys...; mload`; returns the key count
    fn compile_metric_ref(&mut self, target: &AstExpr, span: Span) -> Option<usize> {
        let Some(index) = metric_index(target) else {
            self.internal_error("unresolved metric", span);
            return None;
        };
        let keys: &[AstExpr] = match &target.kind {
            ExprKind::Index { keys, .. } => keys,
            _ => &[],
        };
        for key in keys {
            self.compile_expr(key);
        }
        self.emit_with(Opcode::Mload, Operand::Int(index as i64));
        Some(keys.len())
    }

    /// `keys...; mload; dload`; returns the metric's value type
    fn compile_datum(&mut self, target: &AstExpr) -> Option<ValueType> {
        let keys = self.compile_metric_ref(target, target.span)?;
        self.emit_with(Opcode::Dload, Operand::Int(keys as i64));
        metric_index(target).map(|i| self.metrics[i].value_type)
    }

    // ===== Expressions =====

    fn compile_expr(&mut self, expr: &AstExpr) {
        match &expr.kind {
            ExprKind::Int(n) => self.emit_with(Opcode::Push, Operand::Int(*n)),
            ExprKind::Float(n) => self.emit_with(Opcode::Push, Operand::Float(*n)),
            ExprKind::Bool(b) => self.emit_with(Opcode::Push, Operand::Bool(*b)),
            ExprKind::Duration(d) => self.emit_with(Opcode::Push, Operand::Duration(*d)),
            ExprKind::Str(s) => {
                let index = self.strings.intern(s);
                self.emit_with(Opcode::Str, Operand::Str(index));
            }

            ExprKind::Pattern(source) => {
                let index = self.regex(source, expr.span);
                self.emit_with(Opcode::Match, Operand::Regex(index));
            }

            ExprKind::Ident { .. } | ExprKind::Index { .. } => {
                if self.compile_datum(expr).is_some() {
                    self.emit_get(expr.ty);
                }
            }

            ExprKind::Capref { binding, .. } => match binding {
                Some(binding) => {
                    let index = self.regex(&binding.pattern, expr.span);
                    self.emit_with(Opcode::Push, Operand::Regex(index));
                    self.emit_with(Opcode::Capref, Operand::Int(binding.group as i64));
                }
                None => self.internal_error("unresolved capture reference", expr.span),
            },

            ExprKind::Convert { op, expr: inner } => {
                self.compile_expr(inner);
                let opcode = match op {
                    Conversion::S2i => Opcode::S2i,
                    Conversion::S2f => Opcode::S2f,
                    Conversion::I2f => Opcode::I2f,
                    Conversion::I2s => Opcode::I2s,
                    Conversion::F2s => Opcode::F2s,
                    Conversion::F2i => Opcode::F2i,
                };
                self.emit(opcode);
            }

            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right, expr.ty),

            ExprKind::Unary { expr: inner, .. } => {
                self.compile_expr(inner);
                if inner.ty == Type::Int {
                    self.emit(Opcode::Neg);
                } else {
                    self.emit(Opcode::Not);
                }
            }

            ExprKind::Assign { op, target, value } => self.compile_assign(*op, target, value),

            ExprKind::IncDec { op, target } => {
                if self.compile_datum(target).is_some() {
                    match op {
                        IncDecOp::Inc => self.emit(Opcode::Inc),
                        IncDecOp::Dec => self.emit(Opcode::Dec),
                    }
                }
            }

            ExprKind::Builtin { name, args } => self.compile_builtin(name, args, expr.span),
        }
    }

    fn emit_get(&mut self, ty: Type) {
        match ty {
            Type::String => self.emit(Opcode::Sget),
            Type::Float => self.emit(Opcode::Fget),
            _ => self.emit(Opcode::Iget),
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &AstExpr, right: &AstExpr, ty: Type) {
        match op {
            BinaryOp::And => {
                let false_label = self.new_label();
                let end = self.new_label();
                self.compile_expr(left);
                self.emit_jump(Opcode::Jnm, false_label);
                self.compile_expr(right);
                self.emit_jump(Opcode::Jnm, false_label);
                self.emit_with(Opcode::Push, Operand::Bool(true));
                self.emit_jump(Opcode::Jmp, end);
                self.bind(false_label);
                self.emit_with(Opcode::Push, Operand::Bool(false));
                self.bind(end);
            }

            BinaryOp::Or => {
                let true_label = self.new_label();
                let end = self.new_label();
                self.compile_expr(left);
                self.emit_jump(Opcode::Jm, true_label);
                self.compile_expr(right);
                self.emit_jump(Opcode::Jm, true_label);
                self.emit_with(Opcode::Push, Operand::Bool(false));
                self.emit_jump(Opcode::Jmp, end);
                self.bind(true_label);
                self.emit_with(Opcode::Push, Operand::Bool(true));
                self.bind(end);
            }

            BinaryOp::Match | BinaryOp::NotMatch => {
                self.compile_expr(left);
                let index = match &right.kind {
                    ExprKind::Pattern(source) => self.regex(source, right.span),
                    _ => {
                        self.internal_error("match against a non-pattern", right.span);
                        return;
                    }
                };
                self.emit_with(Opcode::Smatch, Operand::Regex(index));
                if op == BinaryOp::NotMatch {
                    self.emit(Opcode::Not);
                }
            }

            op if op.is_comparison() => {
                self.compile_expr(left);
                self.compile_expr(right);
                let opcode = match (left.ty, right.ty) {
                    (Type::Int, Type::Int) | (Type::Bool, Type::Bool) => Opcode::Icmp,
                    (Type::Float, Type::Float) => Opcode::Fcmp,
                    (Type::String, Type::String) => Opcode::Scmp,
                    _ => Opcode::Cmp,
                };
                // (operand, jump when the comparison result means false)
                let (operand, jump) = match op {
                    BinaryOp::Lt => (-1, Opcode::Jnm),
                    BinaryOp::Gt => (1, Opcode::Jnm),
                    BinaryOp::Eq => (0, Opcode::Jnm),
                    BinaryOp::LtEq => (1, Opcode::Jm),
                    BinaryOp::GtEq => (-1, Opcode::Jm),
                    _ => (0, Opcode::Jm),
                };
                self.emit_with(opcode, Operand::Int(operand));
                let false_label = self.new_label();
                let end = self.new_label();
                self.emit_jump(jump, false_label);
                self.emit_with(Opcode::Push, Operand::Bool(true));
                self.emit_jump(Opcode::Jmp, end);
                self.bind(false_label);
                self.emit_with(Opcode::Push, Operand::Bool(false));
                self.bind(end);
            }

            _ => {
                self.compile_expr(left);
                self.compile_expr(right);
                let float = ty == Type::Float;
                let opcode = match op {
                    BinaryOp::Add if ty == Type::String => Opcode::Cat,
                    BinaryOp::Add if float => Opcode::Fadd,
                    BinaryOp::Add => Opcode::Iadd,
                    BinaryOp::Sub if float => Opcode::Fsub,
                    BinaryOp::Sub => Opcode::Isub,
                    BinaryOp::Mul if float => Opcode::Fmul,
                    BinaryOp::Mul => Opcode::Imul,
                    BinaryOp::Div if float => Opcode::Fdiv,
                    BinaryOp::Div => Opcode::Idiv,
                    BinaryOp::Mod if float => Opcode::Fmod,
                    BinaryOp::Mod => Opcode::Imod,
                    BinaryOp::Pow if float => Opcode::Fpow,
                    BinaryOp::Pow => Opcode::Ipow,
                    BinaryOp::Shl => Opcode::Shl,
                    BinaryOp::Shr => Opcode::Shr,
                    BinaryOp::BitAnd => Opcode::And,
                    BinaryOp::BitOr => Opcode::Or,
                    _ => Opcode::Xor,
                };
                self.emit(opcode);
            }
        }
    }

    fn compile_assign(&mut self, op: AssignOp, target: &AstExpr, value: &AstExpr) {
        let Some(value_type) = self.compile_datum(target) else {
            return;
        };

        match (op, value_type) {
            (AssignOp::Assign, _) => {
                self.compile_expr(value);
                self.emit(store_opcode(value_type));
            }
            (AssignOp::AddAssign, ValueType::Int) => {
                self.compile_expr(value);
                self.emit_with(Opcode::Inc, Operand::Int(0));
            }
            (AssignOp::AddAssign, ValueType::String) => {
                self.compile_datum(target);
                self.emit(Opcode::Sget);
                self.compile_expr(value);
                self.emit(Opcode::Cat);
                self.emit(Opcode::Sset);
            }
            (AssignOp::AddAssign, _) => {
                self.compile_datum(target);
                self.emit(Opcode::Fget);
                self.compile_expr(value);
                self.emit(Opcode::Fadd);
                self.emit(Opcode::Fset);
            }
        }
    }

    fn compile_builtin(&mut self, name: &str, args: &[AstExpr], span: Span) {
        match name {
            "subst" => {
                let [old, new, value] = args else {
                    self.internal_error("subst arity", span);
                    return;
                };
                let rsubst = match &old.kind {
                    ExprKind::Pattern(source) => {
                        let index = self.regex(source, old.span);
                        self.emit_with(Opcode::Push, Operand::Regex(index));
                        true
                    }
                    _ => {
                        self.compile_expr(old);
                        false
                    }
                };
                self.compile_expr(new);
                self.compile_expr(value);
                let opcode = if rsubst { Opcode::Rsubst } else { Opcode::Subst };
                self.emit_with(opcode, Operand::Int(3));
            }
            _ => {
                for arg in args {
                    self.compile_expr(arg);
                }
                let arity = Operand::Int(args.len() as i64);
                match name {
                    "strptime" => self.emit_with(Opcode::Strptime, arity),
                    "timestamp" => self.emit(Opcode::Timestamp),
                    "getfilename" => self.emit(Opcode::Getfilename),
                    "tolower" => self.emit(Opcode::Tolower),
                    "len" => self.emit(Opcode::Length),
                    "strtol" => self.emit_with(Opcode::S2i, arity),
                    "settime" => self.emit(Opcode::Settime),
                    other => {
                        self.internal_error(&format!("builtin `{}` reached codegen", other), span)
                    }
                }
            }
        }
    }
}

fn store_opcode(value_type: ValueType) -> Opcode {
    match value_type {
        ValueType::Int => Opcode::Iset,
        ValueType::Float | ValueType::Buckets => Opcode::Fset,
        ValueType::String => Opcode::Sset,
    }
}
