//! Semantic checker
//!
//! Resolves identifiers and capture references, assigns a [`Type`] to every
//! expression, inserts [`Conversion`] nodes where operands disagree, expands
//! decorators and enforces the compile limits.

use super::CompileOptions;
use super::ast::*;
use super::error::{ErrorKind, ErrorList, ParseError};
use super::lexer::Span;
use crate::store::{Kind, ValueType};
use regex::Regex;
use std::collections::HashMap;

/// Checking restarts at most this many times after a metric's type widens
const MAX_TYPE_PASSES: usize = 4;

/// A declared metric and the value type inferred from its uses
#[derive(Debug, Clone)]
pub struct MetricInfo {
    pub decl: Decl,
    pub value_type: ValueType,
}

/// Output of the checker, ready for code generation
#[derive(Debug, Clone)]
pub struct CheckedProgram {
    pub ast: AstProgram,
    pub metrics: Vec<MetricInfo>,
}

#[derive(Debug, Clone)]
enum Entry {
    Metric(usize),
    /// Pattern source of a `const`
    Const(String),
    Capture { binding: CaprefBinding, ty: Type },
}

pub struct Checker {
    filename: String,
    max_regexp_length: usize,
    max_recursion_depth: usize,
    errors: ErrorList,
    metrics: Vec<MetricInfo>,
    /// Metric value types carried over from the previous pass
    seeded: HashMap<String, ValueType>,
    widened: bool,
    scopes: Vec<HashMap<String, Entry>>,
    decorators: HashMap<String, Block>,
    expanding: Vec<String>,
    depth: usize,
    aborted: bool,
}

fn metric_type(value_type: ValueType) -> Type {
    match value_type {
        ValueType::Int => Type::Int,
        ValueType::Float | ValueType::Buckets => Type::Float,
        ValueType::String => Type::String,
    }
}

fn convert(op: Conversion, expr: AstExpr) -> AstExpr {
    let span = expr.span;
    AstExpr::typed(
        ExprKind::Convert {
            op,
            expr: Box::new(expr),
        },
        span,
        op.result_type(),
    )
}

/// A capture reference that was converted to a number, unwrapped back to
/// its string form
fn strip_capref_conversion(expr: AstExpr) -> Result<AstExpr, AstExpr> {
    match expr.kind {
        ExprKind::Convert {
            op: Conversion::S2i | Conversion::S2f,
            expr: inner,
        } if matches!(inner.kind, ExprKind::Capref { .. }) => Ok(*inner),
        kind => Err(AstExpr { kind, ..expr }),
    }
}

impl Checker {
    pub fn new(filename: &str, options: &CompileOptions) -> Self {
        Checker {
            filename: filename.to_string(),
            max_regexp_length: options.max_regexp_length,
            max_recursion_depth: options.max_recursion_depth,
            errors: ErrorList::new(filename),
            metrics: Vec::new(),
            seeded: HashMap::new(),
            widened: false,
            scopes: vec![HashMap::new()],
            decorators: HashMap::new(),
            expanding: Vec::new(),
            depth: 0,
            aborted: false,
        }
    }

    fn reset(&mut self) {
        self.errors = ErrorList::new(self.filename.as_str());
        self.metrics.clear();
        self.widened = false;
        self.scopes = vec![HashMap::new()];
        self.decorators.clear();
        self.expanding.clear();
        self.depth = 0;
        self.aborted = false;
    }

    /// Check a whole program
    pub fn check(mut self, program: AstProgram) -> Result<CheckedProgram, ErrorList> {
        let mut passes = 0;
        loop {
            self.reset();
            let statements = self.check_stmts(program.statements.clone(), true);
            passes += 1;

            if !self.errors.is_empty() {
                return Err(self.errors);
            }
            if !self.widened || passes >= MAX_TYPE_PASSES {
                return Ok(CheckedProgram {
                    ast: AstProgram {
                        statements,
                        span: program.span,
                    },
                    metrics: self.metrics,
                });
            }

            self.seeded = self
                .metrics
                .iter()
                .map(|m| (m.decl.name.clone(), m.value_type))
                .collect();
        }
    }

    // ===== Diagnostics and scopes =====

    fn error(&mut self, kind: ErrorKind, message: impl Into<String>, span: Span) {
        self.errors.push(ParseError::with_kind(kind, message, span));
    }

    fn abort(&mut self, message: impl Into<String>, span: Span) {
        if !self.aborted {
            self.error(ErrorKind::LimitExceeded, message, span);
            self.aborted = true;
        }
    }

    fn enter(&mut self, span: Span) -> bool {
        self.depth += 1;
        if self.depth > self.max_recursion_depth {
            self.abort(
                format!(
                    "Expression nesting exceeds the maximum depth of {}",
                    self.max_recursion_depth
                ),
                span,
            );
            self.depth -= 1;
            return false;
        }
        true
    }

    fn lookup(&self, name: &str) -> Option<&Entry> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn declare(&mut self, name: String, entry: Entry) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, entry);
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // ===== Statements =====

    fn check_stmts(&mut self, stmts: Vec<AstStmt>, top_level: bool) -> Vec<AstStmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            if self.aborted {
                break;
            }
            if !self.enter(stmt.span()) {
                break;
            }
            let checked = self.check_stmt(stmt, top_level);
            self.depth -= 1;
            out.push(checked);
        }
        out
    }

    fn check_block(&mut self, block: Block) -> Block {
        self.push_scope();
        let stmts = self.check_stmts(block.stmts, false);
        self.pop_scope();
        Block {
            stmts,
            span: block.span,
        }
    }

    fn check_stmt(&mut self, stmt: AstStmt, top_level: bool) -> AstStmt {
        match stmt {
            AstStmt::Decl(decl) => {
                self.check_decl(&decl, top_level);
                AstStmt::Decl(decl)
            }

            AstStmt::Const {
                name,
                pattern,
                span,
            } => {
                match self.resolve_pattern(&pattern) {
                    Some(source) => {
                        if matches!(self.scopes.last().and_then(|s| s.get(&name)), Some(_)) {
                            self.error(
                                ErrorKind::Redeclaration,
                                format!("Redeclaration of `{}`", name),
                                span,
                            );
                        }
                        self.declare(name.clone(), Entry::Const(source));
                    }
                    None => self.error(
                        ErrorKind::TypeMismatch,
                        format!("const `{}` must be a pattern", name),
                        pattern.span,
                    ),
                }
                AstStmt::Const {
                    name,
                    pattern,
                    span,
                }
            }

            AstStmt::Cond {
                cond,
                then,
                else_branch,
                span,
            } => {
                self.push_scope();
                let cond = self.check_condition(cond);
                let then = self.check_block(then);
                self.pop_scope();
                let else_branch = else_branch.map(|b| self.check_block(b));
                AstStmt::Cond {
                    cond,
                    then,
                    else_branch,
                    span,
                }
            }

            AstStmt::Otherwise { body, span } => AstStmt::Otherwise {
                body: self.check_block(body),
                span,
            },

            AstStmt::DecoDef { name, body, span } => {
                if !top_level {
                    self.error(
                        ErrorKind::InvalidStatement,
                        format!("Decorator `{}` must be defined at the top level", name),
                        span,
                    );
                } else if self.decorators.contains_key(&name) {
                    self.error(
                        ErrorKind::Redeclaration,
                        format!("Redeclaration of decorator `{}`", name),
                        span,
                    );
                } else {
                    let nexts = count_next(&body.stmts);
                    if nexts != 1 {
                        self.error(
                            ErrorKind::InvalidStatement,
                            format!(
                                "Decorator `{}` must contain exactly one `next`, found {}",
                                name, nexts
                            ),
                            span,
                        );
                    }
                    self.decorators.insert(name.clone(), body.clone());
                }
                AstStmt::DecoDef { name, body, span }
            }

            AstStmt::Deco {
                name, body, span, ..
            } => {
                let expanded = self.expand_decorator(&name, &body, span);
                AstStmt::Deco {
                    name,
                    body,
                    expanded,
                    span,
                }
            }

            AstStmt::Next { span } => {
                self.error(
                    ErrorKind::InvalidStatement,
                    "`next` can only be used inside a decorator definition",
                    span,
                );
                AstStmt::Next { span }
            }

            AstStmt::Stop { span } => AstStmt::Stop { span },

            AstStmt::Del {
                target,
                expiry,
                span,
            } => AstStmt::Del {
                target: self.check_lvalue(target),
                expiry,
                span,
            },

            AstStmt::Expr(expr) => {
                let expr = self.check_expr(expr);
                if !matches!(expr.ty, Type::None | Type::Undef) {
                    self.error(
                        ErrorKind::InvalidStatement,
                        format!("Expression of type {} has no effect", expr.ty),
                        expr.span,
                    );
                }
                AstStmt::Expr(expr)
            }
        }
    }

    fn check_decl(&mut self, decl: &Decl, top_level: bool) {
        if !top_level {
            self.error(
                ErrorKind::InvalidDeclaration,
                format!("Metric `{}` must be declared at the top level", decl.name),
                decl.span,
            );
            return;
        }
        if self.scopes[0].contains_key(&decl.name) {
            self.error(
                ErrorKind::Redeclaration,
                format!("Redeclaration of metric `{}`", decl.name),
                decl.span,
            );
            return;
        }

        let value_type = match decl.kind {
            Kind::Text => ValueType::String,
            Kind::Histogram => ValueType::Buckets,
            Kind::Counter | Kind::Gauge | Kind::Timer => self
                .seeded
                .get(&decl.name)
                .copied()
                .unwrap_or(ValueType::Int),
        };

        let index = self.metrics.len();
        self.metrics.push(MetricInfo {
            decl: decl.clone(),
            value_type,
        });
        self.scopes[0].insert(decl.name.clone(), Entry::Metric(index));
    }

    fn expand_decorator(&mut self, name: &str, body: &Block, span: Span) -> Option<Block> {
        let Some(def) = self.decorators.get(name).cloned() else {
            self.error(
                ErrorKind::UndefinedSymbol,
                format!("Decorator `@{}` is not defined", name),
                span,
            );
            return None;
        };
        if self.expanding.iter().any(|n| n == name) {
            self.error(
                ErrorKind::InvalidStatement,
                format!("Decorator `@{}` is used recursively", name),
                span,
            );
            return None;
        }

        let mut expanded = def;
        inline_next(&mut expanded.stmts, &body.stmts);
        expanded.span = span;

        self.expanding.push(name.to_string());
        let expanded = self.check_block(expanded);
        self.expanding.pop();
        Some(expanded)
    }

    // ===== Patterns =====

    /// Source text of a pattern expression: literals, consts and their `+`
    /// concatenations
    fn resolve_pattern(&self, expr: &AstExpr) -> Option<String> {
        match &expr.kind {
            ExprKind::Pattern(source) => Some(source.clone()),
            ExprKind::Ident { name, .. } => match self.lookup(name) {
                Some(Entry::Const(source)) => Some(source.clone()),
                _ => None,
            },
            ExprKind::Binary {
                op: BinaryOp::Add,
                left,
                right,
            } => {
                let left = self.resolve_pattern(left)?;
                let right = self.resolve_pattern(right)?;
                Some(left + &right)
            }
            _ => None,
        }
    }

    /// Validate a regex and declare its capture groups in the current scope
    fn check_pattern(&mut self, source: String, span: Span) -> AstExpr {
        if source.len() > self.max_regexp_length {
            self.abort(
                format!(
                    "Regular expression is {} bytes, longer than the maximum of {}",
                    source.len(),
                    self.max_regexp_length
                ),
                span,
            );
            return AstExpr::typed(ExprKind::Pattern(source), span, Type::Undef);
        }

        let re = match Regex::new(&source) {
            Ok(re) => re,
            Err(err) => {
                let text = err.to_string();
                let reason = text.lines().last().unwrap_or("invalid syntax").trim().to_string();
                self.error(
                    ErrorKind::InvalidExpression,
                    format!("Invalid regular expression /{}/: {}", source, reason),
                    span,
                );
                return AstExpr::typed(ExprKind::Pattern(source), span, Type::Undef);
            }
        };

        let bodies = group_bodies(&source);
        let names: Vec<Option<String>> =
            re.capture_names().map(|n| n.map(str::to_string)).collect();
        for (group, name) in names.into_iter().enumerate().skip(1) {
            let ty = bodies
                .get(group - 1)
                .map(|body| capture_type(body))
                .unwrap_or(Type::String);
            let entry = Entry::Capture {
                binding: CaprefBinding {
                    pattern: source.clone(),
                    group,
                },
                ty,
            };
            self.declare(format!("${}", group), entry.clone());
            if let Some(name) = name {
                self.declare(format!("${}", name), entry);
            }
        }

        AstExpr::typed(ExprKind::Pattern(source), span, Type::Pattern)
    }

    // ===== Expressions =====

    fn check_condition(&mut self, expr: AstExpr) -> AstExpr {
        let expr = self.check_expr(expr);
        match expr.ty {
            Type::Bool | Type::Pattern | Type::Undef => {}
            other => self.error(
                ErrorKind::TypeMismatch,
                format!("Condition must be a pattern or comparison, found {}", other),
                expr.span,
            ),
        }
        expr
    }

    pub fn check_expr(&mut self, expr: AstExpr) -> AstExpr {
        if self.aborted || !self.enter(expr.span) {
            return expr;
        }
        let checked = self.check_expr_kind(expr);
        self.depth -= 1;
        checked
    }

    fn check_expr_kind(&mut self, expr: AstExpr) -> AstExpr {
        let span = expr.span;

        if matches!(expr.kind, ExprKind::Binary { op: BinaryOp::Add, .. })
            && let Some(source) = self.resolve_pattern(&expr)
        {
            return self.check_pattern(source, span);
        }

        match expr.kind {
            kind @ ExprKind::Int(_) => AstExpr::typed(kind, span, Type::Int),
            kind @ ExprKind::Float(_) => AstExpr::typed(kind, span, Type::Float),
            kind @ ExprKind::Str(_) => AstExpr::typed(kind, span, Type::String),
            kind @ ExprKind::Bool(_) => AstExpr::typed(kind, span, Type::Bool),
            kind @ ExprKind::Duration(_) => AstExpr::typed(kind, span, Type::Duration),

            ExprKind::Pattern(source) => self.check_pattern(source, span),

            ExprKind::Ident { name, .. } => match self.lookup(&name).cloned() {
                Some(Entry::Metric(index)) => {
                    let info = &self.metrics[index];
                    let ty = metric_type(info.value_type);
                    let key_count = info.decl.keys.len();
                    if key_count > 0 {
                        self.error(
                            ErrorKind::TypeMismatch,
                            format!("Metric `{}` has {} keys and must be indexed", name, key_count),
                            span,
                        );
                    }
                    AstExpr::typed(
                        ExprKind::Ident {
                            name,
                            symbol: Some(Symbol::Metric(index)),
                        },
                        span,
                        ty,
                    )
                }
                Some(Entry::Const(source)) => self.check_pattern(source, span),
                _ => {
                    self.errors.push(
                        ParseError::with_kind(
                            ErrorKind::UndefinedSymbol,
                            format!("Identifier `{}` is not declared", name),
                            span,
                        )
                        .with_suggestion(format!("Declare it first, e.g. `counter {}`", name)),
                    );
                    AstExpr::typed(ExprKind::Ident { name, symbol: None }, span, Type::Undef)
                }
            },

            ExprKind::Capref { name, .. } => match self.lookup(&format!("${}", name)).cloned() {
                Some(Entry::Capture { binding, ty }) => {
                    let capref = AstExpr::typed(
                        ExprKind::Capref {
                            name,
                            binding: Some(binding),
                        },
                        span,
                        Type::String,
                    );
                    match ty {
                        Type::Int => convert(Conversion::S2i, capref),
                        Type::Float => convert(Conversion::S2f, capref),
                        _ => capref,
                    }
                }
                _ => {
                    self.error(
                        ErrorKind::UndefinedSymbol,
                        format!("Capture group `${}` is not defined by an enclosing pattern", name),
                        span,
                    );
                    AstExpr::typed(ExprKind::Capref { name, binding: None }, span, Type::Undef)
                }
            },

            ExprKind::Index { target, keys } => self.check_index(*target, keys, span),

            ExprKind::Binary { op, left, right } => self.check_binary(op, *left, *right, span),

            ExprKind::Unary { op, expr } => {
                let expr = self.check_expr(*expr);
                let ty = match expr.ty {
                    Type::Bool | Type::Pattern => Type::Bool,
                    Type::Int => Type::Int,
                    Type::Undef => Type::Undef,
                    other => {
                        self.error(
                            ErrorKind::TypeMismatch,
                            format!("Operator `{}` can not be applied to {}", op, other),
                            span,
                        );
                        Type::Undef
                    }
                };
                AstExpr::typed(
                    ExprKind::Unary {
                        op,
                        expr: Box::new(expr),
                    },
                    span,
                    ty,
                )
            }

            ExprKind::Assign { op, target, value } => self.check_assign(op, *target, *value, span),

            ExprKind::IncDec { op, target } => {
                let target = self.check_lvalue(*target);
                if let Some(index) = metric_index(&target) {
                    let info = &self.metrics[index];
                    if !matches!(info.value_type, ValueType::Int | ValueType::Float) {
                        let message = format!(
                            "`{}` can not be applied to {} `{}`",
                            if op == IncDecOp::Inc { "++" } else { "--" },
                            info.decl.kind,
                            info.decl.name
                        );
                        self.error(ErrorKind::TypeMismatch, message, span);
                    }
                }
                AstExpr::typed(
                    ExprKind::IncDec {
                        op,
                        target: Box::new(target),
                    },
                    span,
                    Type::None,
                )
            }

            ExprKind::Builtin { name, args } => self.check_builtin(name, args, span),

            ExprKind::Convert { op, expr } => AstExpr::typed(
                ExprKind::Convert { op, expr },
                span,
                op.result_type(),
            ),
        }
    }

    fn check_index(&mut self, target: AstExpr, keys: Vec<AstExpr>, span: Span) -> AstExpr {
        let name = match &target.kind {
            ExprKind::Ident { name, .. } => name.clone(),
            _ => {
                self.error(
                    ErrorKind::TypeMismatch,
                    "Only metrics can be indexed",
                    target.span,
                );
                return AstExpr::typed(
                    ExprKind::Index {
                        target: Box::new(target),
                        keys,
                    },
                    span,
                    Type::Undef,
                );
            }
        };

        let (symbol, ty) = match self.lookup(&name) {
            Some(Entry::Metric(index)) => {
                let index = *index;
                let info = &self.metrics[index];
                let expected = info.decl.keys.len();
                let ty = metric_type(info.value_type);
                if keys.len() != expected {
                    self.error(
                        ErrorKind::TypeMismatch,
                        format!(
                            "Metric `{}` takes {} keys, found {}",
                            name,
                            expected,
                            keys.len()
                        ),
                        span,
                    );
                }
                (Some(Symbol::Metric(index)), ty)
            }
            _ => {
                self.error(
                    ErrorKind::UndefinedSymbol,
                    format!("Metric `{}` is not declared", name),
                    target.span,
                );
                (None, Type::Undef)
            }
        };

        let keys = keys.into_iter().map(|k| self.check_string_arg(k)).collect();
        let target = AstExpr::typed(ExprKind::Ident { name, symbol }, target.span, ty);
        AstExpr::typed(
            ExprKind::Index {
                target: Box::new(target),
                keys,
            },
            span,
            ty,
        )
    }

    /// Metric reads and writes; anything else is an error
    fn check_lvalue(&mut self, expr: AstExpr) -> AstExpr {
        match expr.kind {
            ExprKind::Ident { .. } | ExprKind::Index { .. } => self.check_expr(expr),
            _ => {
                self.error(
                    ErrorKind::InvalidExpression,
                    "Only metrics can be assigned, incremented or deleted",
                    expr.span,
                );
                AstExpr::typed(expr.kind, expr.span, Type::Undef)
            }
        }
    }

    fn check_string_arg(&mut self, expr: AstExpr) -> AstExpr {
        let expr = self.check_expr(expr);
        self.as_string(expr)
    }

    /// Coerce a checked expression to String
    fn as_string(&mut self, expr: AstExpr) -> AstExpr {
        match expr.ty {
            Type::String | Type::Undef => expr,
            Type::Int => strip_capref_conversion(expr)
                .unwrap_or_else(|expr| convert(Conversion::I2s, expr)),
            Type::Float => strip_capref_conversion(expr)
                .unwrap_or_else(|expr| convert(Conversion::F2s, expr)),
            other => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Expected a string, found {}", other),
                    expr.span,
                );
                AstExpr::typed(expr.kind, expr.span, Type::Undef)
            }
        }
    }

    /// Coerce a checked string expression to `ty`
    fn string_to(&mut self, expr: AstExpr, ty: Type) -> AstExpr {
        if let ExprKind::Str(s) = &expr.kind {
            let s = s.clone();
            self.error(
                ErrorKind::TypeMismatch,
                format!("String literal {:?} used as a number", s),
                expr.span,
            );
            return AstExpr::typed(expr.kind, expr.span, Type::Undef);
        }
        match ty {
            Type::Float => convert(Conversion::S2f, expr),
            _ => convert(Conversion::S2i, expr),
        }
    }

    fn check_binary(&mut self, op: BinaryOp, left: AstExpr, right: AstExpr, span: Span) -> AstExpr {
        let (left, right, ty) = match op {
            BinaryOp::And | BinaryOp::Or => {
                let left = self.check_condition(left);
                let right = self.check_condition(right);
                (left, right, Type::Bool)
            }

            BinaryOp::Match | BinaryOp::NotMatch => {
                let left = self.check_string_arg(left);
                let right = match self.resolve_pattern(&right) {
                    Some(source) => self.check_pattern(source, right.span),
                    None => {
                        self.error(
                            ErrorKind::TypeMismatch,
                            format!("Right side of `{}` must be a pattern", op),
                            right.span,
                        );
                        AstExpr::typed(right.kind, right.span, Type::Undef)
                    }
                };
                (left, right, Type::Bool)
            }

            op if op.is_comparison() => {
                let left = self.check_expr(left);
                let right = self.check_expr(right);
                let (left, right) = self.unify_comparison(op, left, right, span);
                (left, right, Type::Bool)
            }

            op if op.is_bitwise() => {
                let left = self.check_expr(left);
                let right = self.check_expr(right);
                let left = self.require_int(op, left);
                let right = self.require_int(op, right);
                let ty = if left.ty == Type::Undef || right.ty == Type::Undef {
                    Type::Undef
                } else {
                    Type::Int
                };
                (left, right, ty)
            }

            _ => {
                let left = self.check_expr(left);
                let right = self.check_expr(right);
                self.unify_arithmetic(op, left, right, span)
            }
        };

        AstExpr::typed(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ty,
        )
    }

    fn require_int(&mut self, op: BinaryOp, expr: AstExpr) -> AstExpr {
        match expr.ty {
            Type::Int | Type::Undef => expr,
            Type::String => self.string_to(expr, Type::Int),
            other => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Operator `{}` requires integers, found {}", op, other),
                    expr.span,
                );
                AstExpr::typed(expr.kind, expr.span, Type::Undef)
            }
        }
    }

    fn unify_arithmetic(
        &mut self,
        op: BinaryOp,
        left: AstExpr,
        right: AstExpr,
        span: Span,
    ) -> (AstExpr, AstExpr, Type) {
        match (left.ty, right.ty) {
            (Type::Undef, _) | (_, Type::Undef) => (left, right, Type::Undef),
            (Type::Int, Type::Int) => (left, right, Type::Int),
            (Type::Float, Type::Float) => (left, right, Type::Float),
            (Type::Int, Type::Float) => (convert(Conversion::I2f, left), right, Type::Float),
            (Type::Float, Type::Int) => (left, convert(Conversion::I2f, right), Type::Float),
            (Type::String, Type::String) if op == BinaryOp::Add => (left, right, Type::String),
            (Type::String, num) if num.is_numeric() => {
                let left = self.string_to(left, num);
                let ty = if left.ty == Type::Undef { Type::Undef } else { num };
                (left, right, ty)
            }
            (num, Type::String) if num.is_numeric() => {
                let right = self.string_to(right, num);
                let ty = if right.ty == Type::Undef { Type::Undef } else { num };
                (left, right, ty)
            }
            (lt, rt) => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Operator `{}` can not be applied to {} and {}", op, lt, rt),
                    span,
                );
                (left, right, Type::Undef)
            }
        }
    }

    fn unify_comparison(
        &mut self,
        op: BinaryOp,
        left: AstExpr,
        right: AstExpr,
        span: Span,
    ) -> (AstExpr, AstExpr) {
        match (left.ty, right.ty) {
            (Type::Undef, _) | (_, Type::Undef) => (left, right),
            (Type::Int, Type::Int)
            | (Type::Float, Type::Float)
            | (Type::String, Type::String)
            | (Type::Bool, Type::Bool) => (left, right),
            (Type::Int, Type::Float) => (convert(Conversion::I2f, left), right),
            (Type::Float, Type::Int) => (left, convert(Conversion::I2f, right)),
            // A string against a numeric literal takes the literal's type;
            // against anything else both sides compare as strings
            (Type::String, num) if num.is_numeric() => {
                if right.is_literal() {
                    (self.string_to(left, num), right)
                } else {
                    let right = self.as_string(right);
                    (left, right)
                }
            }
            (num, Type::String) if num.is_numeric() => {
                if left.is_literal() {
                    let right = self.string_to(right, num);
                    (left, right)
                } else {
                    (self.as_string(left), right)
                }
            }
            (lt, rt) => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Can not compare {} with {} using `{}`", lt, rt, op),
                    span,
                );
                (left, right)
            }
        }
    }

    fn check_assign(&mut self, op: AssignOp, target: AstExpr, value: AstExpr, span: Span) -> AstExpr {
        let target = self.check_lvalue(target);
        let mut value = self.check_expr(value);

        if let (Some(index), false) = (metric_index(&target), value.ty == Type::Undef) {
            let value_type = self.metrics[index].value_type;
            let bad = |checker: &mut Checker, value: &AstExpr| {
                let info = &checker.metrics[index];
                let message = format!(
                    "Can not assign {} to {} `{}`",
                    value.ty, info.decl.kind, info.decl.name
                );
                checker.error(ErrorKind::TypeMismatch, message, value.span);
            };

            value = match (op, value_type, value.ty) {
                (_, ValueType::Int, Type::Int) => value,
                (_, ValueType::Int, Type::String) => value,
                (_, ValueType::Int, Type::Float) => {
                    self.metrics[index].value_type = ValueType::Float;
                    self.widened = true;
                    value
                }
                (_, ValueType::Float, Type::Float) | (_, ValueType::Float, Type::String) => value,
                (_, ValueType::Float, Type::Int) => convert(Conversion::I2f, value),
                (AssignOp::Assign, ValueType::Buckets, Type::Float)
                | (AssignOp::Assign, ValueType::Buckets, Type::String) => value,
                (AssignOp::Assign, ValueType::Buckets, Type::Int) => {
                    convert(Conversion::I2f, value)
                }
                (_, ValueType::String, Type::String | Type::Int | Type::Float) => {
                    self.as_string(value)
                }
                _ => {
                    bad(self, &value);
                    value
                }
            };
        }

        AstExpr::typed(
            ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
            Type::None,
        )
    }

    fn check_builtin(&mut self, name: String, args: Vec<AstExpr>, span: Span) -> AstExpr {
        let arity = match name.as_str() {
            "timestamp" | "getfilename" => 0,
            "tolower" | "len" | "settime" | "int" | "float" | "string" | "bool" => 1,
            "strptime" | "strtol" => 2,
            "subst" => 3,
            _ => {
                self.error(
                    ErrorKind::UndefinedSymbol,
                    format!("Unknown builtin `{}`", name),
                    span,
                );
                return AstExpr::typed(ExprKind::Builtin { name, args }, span, Type::Undef);
            }
        };
        if args.len() != arity {
            self.error(
                ErrorKind::InvalidExpression,
                format!(
                    "Builtin `{}` takes {} argument{}, found {}",
                    name,
                    arity,
                    if arity == 1 { "" } else { "s" },
                    args.len()
                ),
                span,
            );
            return AstExpr::typed(ExprKind::Builtin { name, args }, span, Type::Undef);
        }

        let mut args = args.into_iter();
        let mut next_arg = || args.next().unwrap_or_else(|| AstExpr::new(ExprKind::Int(0), span));

        let (args, ty) = match name.as_str() {
            "timestamp" => (vec![], Type::Int),
            "getfilename" => (vec![], Type::String),
            "tolower" => (vec![self.check_string_arg(next_arg())], Type::String),
            "len" => (vec![self.check_string_arg(next_arg())], Type::Int),
            "strptime" => {
                let value = self.check_string_arg(next_arg());
                let layout = self.check_expr(next_arg());
                if !matches!(layout.kind, ExprKind::Str(_)) {
                    self.error(
                        ErrorKind::TypeMismatch,
                        "strptime layout must be a string literal",
                        layout.span,
                    );
                }
                (vec![value, layout], Type::None)
            }
            "strtol" => {
                let value = self.check_string_arg(next_arg());
                let base = self.check_expr(next_arg());
                let base = self.require_int(BinaryOp::Add, base);
                (vec![value, base], Type::Int)
            }
            "settime" => {
                let value = self.check_expr(next_arg());
                let value = match value.ty {
                    Type::Float => convert(Conversion::F2i, value),
                    Type::String => self.string_to(value, Type::Int),
                    _ => self.require_int(BinaryOp::Add, value),
                };
                (vec![value], Type::None)
            }
            "subst" => {
                let old = next_arg();
                let old = match self.resolve_pattern(&old) {
                    Some(source) => self.check_pattern(source, old.span),
                    None => self.check_string_arg(old),
                };
                let new = self.check_string_arg(next_arg());
                let value = self.check_string_arg(next_arg());
                (vec![old, new, value], Type::String)
            }
            "int" => return self.convert_builtin(next_arg(), Type::Int),
            "float" => return self.convert_builtin(next_arg(), Type::Float),
            "string" => {
                let value = self.check_expr(next_arg());
                return self.as_string(value);
            }
            _ => {
                // bool
                let value = self.check_expr(next_arg());
                return self.to_bool(value);
            }
        };

        AstExpr::typed(ExprKind::Builtin { name, args }, span, ty)
    }

    /// `int(x)` and `float(x)` lower to plain conversions
    fn convert_builtin(&mut self, arg: AstExpr, ty: Type) -> AstExpr {
        let value = self.check_expr(arg);
        match (value.ty, ty) {
            (Type::Undef, _) => value,
            (Type::Int, Type::Int) | (Type::Float, Type::Float) => value,
            (Type::Float, Type::Int) => convert(Conversion::F2i, value),
            (Type::Int, Type::Float) => convert(Conversion::I2f, value),
            (Type::String, _) => self.string_to(value, ty),
            (other, _) => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Can not convert {} to {}", other, ty),
                    value.span,
                );
                AstExpr::typed(value.kind, value.span, Type::Undef)
            }
        }
    }

    /// `bool(x)` is `x != 0` for numbers
    fn to_bool(&mut self, value: AstExpr) -> AstExpr {
        let span = value.span;
        let value = match value.ty {
            Type::Bool | Type::Pattern | Type::Undef => return value,
            Type::String => self.string_to(value, Type::Int),
            _ => value,
        };
        let zero = match value.ty {
            Type::Float => AstExpr::typed(ExprKind::Float(0.0), span, Type::Float),
            Type::Int => AstExpr::typed(ExprKind::Int(0), span, Type::Int),
            Type::Undef => return value,
            other => {
                self.error(
                    ErrorKind::TypeMismatch,
                    format!("Can not convert {} to Bool", other),
                    span,
                );
                return AstExpr::typed(value.kind, span, Type::Undef);
            }
        };
        AstExpr::typed(
            ExprKind::Binary {
                op: BinaryOp::NotEq,
                left: Box::new(value),
                right: Box::new(zero),
            },
            span,
            Type::Bool,
        )
    }
}

/// Metric index behind a checked `m` or `m[...]`
pub fn metric_index(expr: &AstExpr) -> Option<usize> {
    match &expr.kind {
        ExprKind::Ident {
            symbol: Some(Symbol::Metric(index)),
            ..
        } => Some(*index),
        ExprKind::Index { target, .. } => metric_index(target),
        _ => None,
    }
}

fn count_next(stmts: &[AstStmt]) -> usize {
    stmts
        .iter()
        .map(|stmt| match stmt {
            AstStmt::Next { .. } => 1,
            AstStmt::Cond {
                then, else_branch, ..
            } => count_next(&then.stmts) + else_branch.as_ref().map_or(0, |b| count_next(&b.stmts)),
            AstStmt::Otherwise { body, .. } | AstStmt::Deco { body, .. } => count_next(&body.stmts),
            _ => 0,
        })
        .sum()
}

/// Replace every `next` in a decorator body with the invocation's statements
fn inline_next(stmts: &mut Vec<AstStmt>, inner: &[AstStmt]) {
    let mut out = Vec::with_capacity(stmts.len() + inner.len());
    for stmt in stmts.drain(..) {
        match stmt {
            AstStmt::Next { .. } => out.extend(inner.iter().cloned()),
            AstStmt::Cond {
                cond,
                mut then,
                else_branch,
                span,
            } => {
                inline_next(&mut then.stmts, inner);
                let else_branch = else_branch.map(|mut b| {
                    inline_next(&mut b.stmts, inner);
                    b
                });
                out.push(AstStmt::Cond {
                    cond,
                    then,
                    else_branch,
                    span,
                });
            }
            AstStmt::Otherwise { mut body, span } => {
                inline_next(&mut body.stmts, inner);
                out.push(AstStmt::Otherwise { body, span });
            }
            AstStmt::Deco {
                name,
                mut body,
                expanded,
                span,
            } => {
                inline_next(&mut body.stmts, inner);
                out.push(AstStmt::Deco {
                    name,
                    body,
                    expanded,
                    span,
                });
            }
            other => out.push(other),
        }
    }
    *stmts = out;
}

/// Source text of each capturing group, in group order
fn group_bodies(source: &str) -> Vec<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut bodies: Vec<String> = Vec::new();
    // (capturing group index, body start)
    let mut open: Vec<(Option<usize>, usize)> = Vec::new();
    let mut in_class = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => {
                if chars.get(i + 1) == Some(&'?') {
                    let named = chars.get(i + 2) == Some(&'<')
                        || (chars.get(i + 2) == Some(&'P') && chars.get(i + 3) == Some(&'<'));
                    let close = chars[i..].iter().position(|c| *c == '>').map(|p| p + i);
                    match (named, close) {
                        (true, Some(close)) => {
                            bodies.push(String::new());
                            open.push((Some(bodies.len() - 1), close + 1));
                            i = close + 1;
                            continue;
                        }
                        _ => open.push((None, i + 1)),
                    }
                } else {
                    bodies.push(String::new());
                    open.push((Some(bodies.len() - 1), i + 1));
                }
            }
            ')' if !in_class => {
                if let Some((Some(group), start)) = open.pop() {
                    bodies[group] = chars[start..i].iter().collect();
                }
            }
            _ => {}
        }
        i += 1;
    }

    bodies
}

/// Int for groups of digits, Float for digits with a decimal point,
/// String for anything else
fn capture_type(body: &str) -> Type {
    let chars: Vec<char> = body.chars().collect();
    let mut digits = false;
    let mut dot = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => match chars.get(i + 1) {
                Some('d') => digits = true,
                Some('.') => dot = true,
                _ => return Type::String,
            },
            '[' => {
                let Some(end) = chars[i..].iter().position(|c| *c == ']').map(|p| p + i) else {
                    return Type::String;
                };
                let class: String = chars[i + 1..end].iter().collect();
                let rest = class.replace("0-9", "").replace("\\d", "");
                if rest.len() == class.len() {
                    return Type::String;
                }
                digits = true;
                match rest.as_str() {
                    "" => {}
                    "." | "\\." => dot = true,
                    _ => return Type::String,
                }
                i = end + 1;
                continue;
            }
            '{' => {
                let Some(end) = chars[i..].iter().position(|c| *c == '}').map(|p| p + i) else {
                    return Type::String;
                };
                if !chars[i + 1..end].iter().all(|c| c.is_ascii_digit() || *c == ',') {
                    return Type::String;
                }
                i = end + 1;
                continue;
            }
            '(' => {
                if chars.get(i + 1) == Some(&'?') && chars.get(i + 2) == Some(&':') {
                    i += 3;
                    continue;
                }
            }
            '+' | '*' | '?' | ')' | '-' => {}
            _ => return Type::String,
        }
        i += if chars[i] == '\\' { 2 } else { 1 };
    }

    match (digits, dot) {
        (true, true) => Type::Float,
        (true, false) => Type::Int,
        _ => Type::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check(source: &str) -> Result<CheckedProgram, ErrorList> {
        let ast = parse("test.mtail", source)?;
        Checker::new("test.mtail", &CompileOptions::default()).check(ast)
    }

    fn check_err(source: &str) -> String {
        match check(source) {
            Ok(_) => panic!("expected check of {:?} to fail", source),
            Err(errors) => errors.to_string(),
        }
    }

    fn first_stmt_in_cond(program: &CheckedProgram, index: usize) -> &AstStmt {
        match &program.ast.statements[index] {
            AstStmt::Cond { then, .. } => &then.stmts[0],
            other => panic!("expected cond, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_types() {
        assert_eq!(capture_type("\\d+"), Type::Int);
        assert_eq!(capture_type("-?[0-9]+"), Type::Int);
        assert_eq!(capture_type("\\d+\\.\\d+"), Type::Float);
        assert_eq!(capture_type("\\d+(?:\\.\\d+)?"), Type::Float);
        assert_eq!(capture_type("[0-9.]+"), Type::Float);
        assert_eq!(capture_type("\\d{1,3}"), Type::Int);
        assert_eq!(capture_type("\\S+"), Type::String);
        assert_eq!(capture_type("a\\d"), Type::String);
        assert_eq!(capture_type(".*"), Type::String);
    }

    #[test]
    fn test_group_bodies() {
        assert_eq!(group_bodies("(\\d+) (foo)"), vec!["\\d+", "foo"]);
        assert_eq!(group_bodies("(?P<n>\\d+)(?:x)(y)"), vec!["\\d+", "y"]);
        assert_eq!(group_bodies("[(](a)"), vec!["a"]);
        assert_eq!(group_bodies("(a(b))"), vec!["a(b)", "b"]);
    }

    #[test]
    fn test_declares_metrics() {
        let program = check("counter a\ngauge b by x, y\ntext t\nhistogram h buckets 1, 2\n").unwrap();
        let types: Vec<ValueType> = program.metrics.iter().map(|m| m.value_type).collect();
        assert_eq!(
            types,
            vec![ValueType::Int, ValueType::Int, ValueType::String, ValueType::Buckets]
        );
    }

    #[test]
    fn test_redeclaration() {
        assert!(check_err("counter a\ngauge a\n").contains("Redeclaration of metric `a`"));
    }

    #[test]
    fn test_undeclared_identifier() {
        assert!(check_err("/x/ { foo++ }\n").contains("Identifier `foo` is not declared"));
    }

    #[test]
    fn test_capref_is_typed_and_converted() {
        let program = check("counter a\n/(\\d+)/ { a = $1 }\n").unwrap();
        let AstStmt::Expr(assign) = first_stmt_in_cond(&program, 1) else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { value, .. } = &assign.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::Convert { op: Conversion::S2i, .. }));
        assert_eq!(value.ty, Type::Int);
    }

    #[test]
    fn test_named_capref() {
        assert!(check("counter a by n\n/(?P<name>\\w+)/ { a[$name]++ }\n").is_ok());
    }

    #[test]
    fn test_capref_keys_stay_strings() {
        let program = check("counter a by n\n/(\\d+)/ { a[$1]++ }\n").unwrap();
        let AstStmt::Expr(incdec) = first_stmt_in_cond(&program, 1) else {
            panic!("expected expression statement");
        };
        let ExprKind::IncDec { target, .. } = &incdec.kind else {
            panic!("expected ++");
        };
        let ExprKind::Index { keys, .. } = &target.kind else {
            panic!("expected index");
        };
        assert!(matches!(keys[0].kind, ExprKind::Capref { .. }));
    }

    #[test]
    fn test_undefined_capref() {
        assert!(check_err("counter a\n/x/ { a = $1 }\n").contains("Capture group `$1`"));
    }

    #[test]
    fn test_capref_visible_after_and() {
        assert!(check("counter a\n/(\\d+)/ && $1 > 3 { a++ }\n").is_ok());
    }

    #[test]
    fn test_capref_not_visible_in_else() {
        let err = check_err("counter a\n/(\\d+)/ { a++ } else { a = $1 }\n");
        assert!(err.contains("Capture group `$1`"));
    }

    #[test]
    fn test_float_assignment_widens_metric() {
        let program = check("gauge g\n/(\\d+\\.\\d+)/ { g = $1 }\n/(\\d+)/ { g = $1 }\n").unwrap();
        assert_eq!(program.metrics[0].value_type, ValueType::Float);
        // second assignment was rechecked against the widened type
        let AstStmt::Expr(assign) = first_stmt_in_cond(&program, 2) else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { value, .. } = &assign.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::Convert { op: Conversion::I2f, .. }));
    }

    #[test]
    fn test_key_count_mismatch() {
        let err = check_err("counter a by x, y\n/x/ { a[\"1\"]++ }\n");
        assert!(err.contains("takes 2 keys, found 1"));
    }

    #[test]
    fn test_unindexed_metric_with_keys() {
        assert!(check_err("counter a by x\n/x/ { a++ }\n").contains("must be indexed"));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(check_err("/(/ {\n}\n").contains("Invalid regular expression"));
    }

    #[test]
    fn test_regex_length_limit_single_error() {
        let pattern = "a".repeat(2000);
        let source = format!("counter c\n/{p}/ {{ c++ }}\n/{p}/ {{ c++ }}\n", p = pattern);
        let ast = parse("test.mtail", &source).unwrap();
        let errors = Checker::new("test.mtail", &CompileOptions::default())
            .check(ast)
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors.to_string().contains("longer than the maximum of 1024"));
    }

    #[test]
    fn test_recursion_limit() {
        let options = CompileOptions {
            max_recursion_depth: 5,
            ..CompileOptions::default()
        };
        let source = "counter c\n/a/ { /b/ { /c/ { /d/ { /e/ { /f/ { c++ } } } } } }\n";
        let ast = parse("test.mtail", source).unwrap();
        let errors = Checker::new("test.mtail", &options).check(ast).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors.to_string().contains("maximum depth of 5"));
    }

    #[test]
    fn test_const_patterns_concatenate() {
        let program = check("counter c\nconst PREFIX /^(\\w+) /\nPREFIX + /(\\d+)$/ { c += $2 }\n").unwrap();
        match &program.ast.statements[2] {
            AstStmt::Cond { cond, .. } => {
                assert!(matches!(&cond.kind, ExprKind::Pattern(p) if p == "^(\\w+) (\\d+)$"));
            }
            other => panic!("expected cond, got {:?}", other),
        }
    }

    #[test]
    fn test_decorator_expansion() {
        let source = "counter c\ndef wrap {\n  /(\\d+)/ {\n    next\n  }\n}\n@wrap {\n  c += $1\n}\n";
        let program = check(source).unwrap();
        match &program.ast.statements[2] {
            AstStmt::Deco { expanded, .. } => {
                let expanded = expanded.as_ref().unwrap();
                assert!(matches!(expanded.stmts[0], AstStmt::Cond { .. }));
            }
            other => panic!("expected decorator, got {:?}", other),
        }
    }

    #[test]
    fn test_decorator_needs_one_next() {
        assert!(check_err("def d {\n}\n").contains("exactly one `next`"));
    }

    #[test]
    fn test_recursive_decorator() {
        let source = "def d {\n  @d {\n    next\n  }\n}\n@d {\n}\n";
        assert!(check_err(source).contains("used recursively"));
    }

    #[test]
    fn test_next_outside_decorator() {
        assert!(check_err("/a/ {\n  next\n}\n").contains("`next` can only be used"));
    }

    #[test]
    fn test_undefined_decorator() {
        assert!(check_err("@nope {\n}\n").contains("Decorator `@nope` is not defined"));
    }

    #[test]
    fn test_string_comparison_with_literal_coerces() {
        let program = check("counter c\n/(\\S+)/ && $1 > 3 { c++ }\n").unwrap();
        let AstStmt::Cond { cond, .. } = &program.ast.statements[1] else {
            panic!("expected cond");
        };
        let ExprKind::Binary { right, .. } = &cond.kind else {
            panic!("expected &&");
        };
        let ExprKind::Binary { left, .. } = &right.kind else {
            panic!("expected >");
        };
        assert!(matches!(left.kind, ExprKind::Convert { op: Conversion::S2i, .. }));
    }

    #[test]
    fn test_text_metric_takes_strings() {
        assert!(check("text t\n/(\\d+)/ { t = $1 }\n").is_ok());
        assert!(check_err("text t\n/x/ { t++ }\n").contains("can not be applied to text `t`"));
    }

    #[test]
    fn test_conversion_builtins_lower() {
        let program = check("gauge g\n/(\\S+)/ { g = int($1) }\n").unwrap();
        let AstStmt::Expr(assign) = first_stmt_in_cond(&program, 1) else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { value, .. } = &assign.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::Convert { op: Conversion::S2i, .. }));
    }

    #[test]
    fn test_builtin_arity() {
        assert!(check_err("counter c\n/x/ { c = len() }\n").contains("takes 1 argument, found 0"));
    }

    #[test]
    fn test_expression_without_effect() {
        assert!(check_err("counter c\n/x/ { c }\n").contains("has no effect"));
    }

    #[test]
    fn test_bad_condition() {
        assert!(check_err("counter c\n1 { c++ }\n").contains("Condition must be"));
    }

    #[test]
    fn test_nested_decl_rejected() {
        assert!(check_err("/x/ {\n  counter c\n}\n").contains("must be declared at the top level"));
    }
}
