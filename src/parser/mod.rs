//! hogtail recursive descent parser and compile pipeline
//!
//! Source text goes through [`Parser`] into an [`AstProgram`], is optimised,
//! type checked by [`Checker`], optimised again and finally lowered by
//! [`Compiler`] into an [`Object`].

pub mod ast;
pub mod checker;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod optimizer;


pub use ast::*;
pub use checker::{CheckedProgram, Checker, MetricInfo};
pub use compiler::Compiler;
pub use error::{ErrorKind, ErrorList, ParseError, ParseResult};
pub use lexer::{Lexer, Position, Span, Token, TokenKind};

use crate::program::Object;
use crate::store::Kind;
use std::path::Path;

/// Parse errors recorded per file before the parser gives up
const MAX_PARSE_ERRORS: usize = 10;

/// Knobs for one compile invocation
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Longest accepted regular expression, in bytes
    pub max_regexp_length: usize,
    /// Deepest accepted AST nesting
    pub max_recursion_depth: usize,
    pub disable_optimisation: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            max_regexp_length: 1024,
            max_recursion_depth: 100,
            disable_optimisation: false,
        }
    }
}

/// Parse program source into an AST
pub fn parse(filename: &str, source: &str) -> Result<AstProgram, ErrorList> {
    let lexer = Lexer::new(source);
    Parser::new(lexer).parse_program(filename)
}

/// Compile program source into an [`Object`].
///
/// `name` may be a path; only its base name is used for the program name.
pub fn compile(name: &str, source: &str, options: &CompileOptions) -> Result<Object, ErrorList> {
    let name = program_name(name);
    let result = compile_named(&name, source, options);
    result.map_err(|errors| attach_source(errors, source))
}

fn compile_named(name: &str, source: &str, options: &CompileOptions) -> Result<Object, ErrorList> {
    let mut ast = parse(name, source)?;
    if !options.disable_optimisation {
        ast = optimizer::optimize(ast, name)?;
    }

    let mut checked = Checker::new(name, options).check(ast)?;
    if !options.disable_optimisation {
        checked.ast = optimizer::optimize(checked.ast, name)?;
    }

    Compiler::new(name).compile(checked)
}

/// Base name of a program path
pub fn program_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn attach_source(errors: ErrorList, source: &str) -> ErrorList {
    let mut with_source = ErrorList::new(errors.filename());
    for error in errors.iter() {
        with_source.push(error.clone().with_source(source));
    }
    with_source
}

/// The main parser struct
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    source: &'a str,
    errors: Vec<ParseError>,
}

impl<'a> Parser<'a> {
    /// Create a new parser from a lexer
    pub fn new(mut lexer: Lexer<'a>) -> Self {
        let source = lexer.source();
        let current = lexer.next_token();
        Parser {
            lexer,
            current,
            source,
            errors: Vec::new(),
        }
    }

    /// Add source context to an error
    fn enrich_error(&self, error: ParseError) -> Box<ParseError> {
        error.with_source(self.source).boxed()
    }

    /// Parse a complete program, collecting every statement-level error
    pub fn parse_program(&mut self, filename: &str) -> Result<AstProgram, ErrorList> {
        let start = self.current.span.start;
        let statements = self.parse_stmt_list(false);
        let end = statements
            .last()
            .map(|s| s.span().end)
            .unwrap_or(start);

        let mut errors = ErrorList::new(filename);
        for error in self.errors.drain(..) {
            errors.push(error);
        }
        errors.into_result(AstProgram {
            statements,
            span: Span::new(start, end),
        })
    }

    fn parse_stmt_list(&mut self, in_block: bool) -> Vec<AstStmt> {
        let mut stmts = Vec::new();

        loop {
            self.skip_newlines();
            match self.current.kind {
                TokenKind::Eof => break,
                TokenKind::RBrace if in_block => break,
                _ => {}
            }

            let before = self.current.span.start;
            let result = self
                .parse_statement()
                .and_then(|stmt| self.expect_terminator(&stmt, in_block).map(|_| stmt));
            match result {
                Ok(stmt) => stmts.push(stmt),
                Err(error) => {
                    self.recover(*error);
                    if self.current.span.start == before && self.current.kind != TokenKind::Eof {
                        self.advance();
                    }
                }
            }
        }

        stmts
    }

    /// Record an error and skip to the end of the broken statement
    fn recover(&mut self, error: ParseError) {
        if self.errors.len() < MAX_PARSE_ERRORS {
            self.errors.push(error);
        }
        if self.errors.len() >= MAX_PARSE_ERRORS {
            while self.current.kind != TokenKind::Eof {
                self.advance();
            }
            return;
        }

        let mut depth = 0usize;
        loop {
            match self.current.kind {
                TokenKind::Eof => break,
                TokenKind::Nl if depth == 0 => break,
                TokenKind::RBrace if depth == 0 => break,
                TokenKind::RBrace => depth -= 1,
                TokenKind::LBrace => depth += 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Simple statements must be followed by a newline, `}` or end of input
    fn expect_terminator(&self, stmt: &AstStmt, in_block: bool) -> ParseResult<()> {
        let ends_with_block = matches!(
            stmt,
            AstStmt::Cond { .. }
                | AstStmt::Otherwise { .. }
                | AstStmt::DecoDef { .. }
                | AstStmt::Deco { .. }
        );
        if ends_with_block {
            return Ok(());
        }
        match self.current.kind {
            TokenKind::Nl | TokenKind::Eof => Ok(()),
            TokenKind::RBrace if in_block => Ok(()),
            _ => Err(self.enrich_error(ParseError::expected(
                TokenKind::Nl,
                self.current.clone(),
            ))),
        }
    }

    /// Parse a single statement
    pub fn parse_statement(&mut self) -> ParseResult<AstStmt> {
        match &self.current.kind {
            TokenKind::Counter
            | TokenKind::Gauge
            | TokenKind::Timer
            | TokenKind::Text
            | TokenKind::Histogram
            | TokenKind::Hidden => self.parse_decl(),
            TokenKind::Const => self.parse_const(),
            TokenKind::Def => self.parse_def(),
            TokenKind::Decorator(_) => self.parse_deco(),
            TokenKind::Otherwise => {
                let start = self.current.span;
                self.advance();
                let body = self.parse_block()?;
                let span = start.to(body.span);
                Ok(AstStmt::Otherwise { body, span })
            }
            TokenKind::Next => {
                let span = self.current.span;
                self.advance();
                Ok(AstStmt::Next { span })
            }
            TokenKind::Stop => {
                let span = self.current.span;
                self.advance();
                Ok(AstStmt::Stop { span })
            }
            TokenKind::Del => self.parse_del(),
            TokenKind::RBrace => Err(self.enrich_error(ParseError::with_kind(
                ErrorKind::InvalidStatement,
                "Unexpected '}'",
                self.current.span,
            ))),
            _ => self.parse_cond_or_expr(),
        }
    }

    /// `[hidden] kind name [by k, ...] [as "name"] [buckets n, ...] [limit n]`
    fn parse_decl(&mut self) -> ParseResult<AstStmt> {
        let start = self.current.span;
        let hidden = if self.check(&TokenKind::Hidden) {
            self.advance();
            true
        } else {
            false
        };

        let kind = match self.current.kind {
            TokenKind::Counter => Kind::Counter,
            TokenKind::Gauge => Kind::Gauge,
            TokenKind::Timer => Kind::Timer,
            TokenKind::Text => Kind::Text,
            TokenKind::Histogram => Kind::Histogram,
            _ => {
                return Err(self.enrich_error(
                    ParseError::with_kind(
                        ErrorKind::InvalidDeclaration,
                        format!("Expected metric kind, found {}", self.current.kind),
                        self.current.span,
                    )
                    .with_suggestion(
                        "Metric kinds are 'counter', 'gauge', 'timer', 'text' and 'histogram'",
                    ),
                ));
            }
        };
        self.advance();

        let (name, name_span) = self.expect_ident()?;
        let mut decl = Decl {
            kind,
            name,
            exported_name: None,
            keys: Vec::new(),
            buckets: Vec::new(),
            limit: None,
            hidden,
            span: start.to(name_span),
        };

        loop {
            match self.current.kind {
                TokenKind::By => {
                    self.advance();
                    loop {
                        let key = match &self.current.kind {
                            TokenKind::Ident(name) | TokenKind::String(name) => name.clone(),
                            _ => {
                                return Err(self.enrich_error(ParseError::with_kind(
                                    ErrorKind::InvalidDeclaration,
                                    format!("Expected label name, found {}", self.current.kind),
                                    self.current.span,
                                )));
                            }
                        };
                        decl.span = decl.span.to(self.current.span);
                        decl.keys.push(key);
                        self.advance();
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        self.advance();
                        self.skip_newlines();
                    }
                }
                TokenKind::As => {
                    self.advance();
                    let tok = self.expect(TokenKind::String(String::new()))?;
                    if let TokenKind::String(exported) = tok.kind {
                        decl.exported_name = Some(exported);
                    }
                    decl.span = decl.span.to(tok.span);
                }
                TokenKind::Buckets => {
                    self.advance();
                    loop {
                        let bound = match self.current.kind {
                            TokenKind::Int(n) => n as f64,
                            TokenKind::Float(n) => n,
                            _ => {
                                return Err(self.enrich_error(ParseError::with_kind(
                                    ErrorKind::InvalidDeclaration,
                                    format!("Expected bucket boundary, found {}", self.current.kind),
                                    self.current.span,
                                )));
                            }
                        };
                        decl.span = decl.span.to(self.current.span);
                        decl.buckets.push(bound);
                        self.advance();
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        self.advance();
                        self.skip_newlines();
                    }
                }
                TokenKind::Limit => {
                    self.advance();
                    match self.current.kind {
                        TokenKind::Int(n) if n > 0 => {
                            decl.limit = Some(n as usize);
                            decl.span = decl.span.to(self.current.span);
                            self.advance();
                        }
                        _ => {
                            return Err(self.enrich_error(ParseError::with_kind(
                                ErrorKind::InvalidDeclaration,
                                format!("Expected positive limit, found {}", self.current.kind),
                                self.current.span,
                            )));
                        }
                    }
                }
                _ => break,
            }
        }

        if !decl.buckets.is_empty() && decl.kind != Kind::Histogram {
            return Err(self.enrich_error(ParseError::with_kind(
                ErrorKind::InvalidDeclaration,
                format!("Only histograms can declare buckets, '{}' is a {}", decl.name, decl.kind),
                decl.span,
            )));
        }

        Ok(AstStmt::Decl(decl))
    }

    /// `const NAME /pattern/`
    fn parse_const(&mut self) -> ParseResult<AstStmt> {
        let start = self.current.span;
        self.advance();
        let (name, _) = self.expect_ident()?;
        let pattern = self.parse_expr()?;
        let span = start.to(pattern.span);
        Ok(AstStmt::Const {
            name,
            pattern,
            span,
        })
    }

    /// `def name { ... }`
    fn parse_def(&mut self) -> ParseResult<AstStmt> {
        let start = self.current.span;
        self.advance();
        let (name, _) = self.expect_ident()?;
        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(AstStmt::DecoDef { name, body, span })
    }

    /// `@name { ... }`
    fn parse_deco(&mut self) -> ParseResult<AstStmt> {
        let start = self.current.span;
        let name = match &self.current.kind {
            TokenKind::Decorator(name) => name.clone(),
            _ => String::new(),
        };
        self.advance();
        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(AstStmt::Deco {
            name,
            body,
            expanded: None,
            span,
        })
    }

    /// `del metric[keys] [after duration]`
    fn parse_del(&mut self) -> ParseResult<AstStmt> {
        let start = self.current.span;
        self.advance();
        let primary = self.parse_primary_expr()?;
        let target = self.parse_index_suffix(primary)?;
        let mut span = start.to(target.span);

        let expiry = if self.check(&TokenKind::After) {
            self.advance();
            match self.current.kind {
                TokenKind::Duration(d) => {
                    span = span.to(self.current.span);
                    self.advance();
                    Some(d)
                }
                _ => {
                    return Err(self.enrich_error(
                        ParseError::with_kind(
                            ErrorKind::InvalidStatement,
                            format!("Expected duration after 'after', found {}", self.current.kind),
                            self.current.span,
                        )
                        .with_suggestion("Durations look like 1h, 30m or 24h0m0s"),
                    ));
                }
            }
        } else {
            None
        };

        Ok(AstStmt::Del {
            target,
            expiry,
            span,
        })
    }

    /// An expression, optionally followed by a block (and `else` block)
    fn parse_cond_or_expr(&mut self) -> ParseResult<AstStmt> {
        let expr = self.parse_expr()?;
        if !self.check(&TokenKind::LBrace) {
            return Ok(AstStmt::Expr(expr));
        }

        let then = self.parse_block()?;
        let mut span = expr.span.to(then.span);

        self.skip_newlines();
        let else_branch = if self.check(&TokenKind::Else) {
            self.advance();
            let block = self.parse_block()?;
            span = span.to(block.span);
            Some(block)
        } else {
            None
        };

        Ok(AstStmt::Cond {
            cond: expr,
            then,
            else_branch,
            span,
        })
    }

    fn parse_block(&mut self) -> ParseResult<Block> {
        let open = self.expect(TokenKind::LBrace)?;
        let stmts = self.parse_stmt_list(true);
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Block {
            stmts,
            span: open.span.to(close.span),
        })
    }

    // ===== Expressions =====

    /// Parse an expression, including assignments
    pub fn parse_expr(&mut self) -> ParseResult<AstExpr> {
        let left = self.parse_expr_with_precedence(0)?;

        let op = match self.current.kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::AddAssign => AssignOp::AddAssign,
            _ => return Ok(left),
        };
        self.advance();
        self.skip_newlines();

        let value = self.parse_expr()?;
        let span = left.span.to(value.span);
        Ok(AstExpr::new(
            ExprKind::Assign {
                op,
                target: Box::new(left),
                value: Box::new(value),
            },
            span,
        ))
    }

    /// Parse expression with operator precedence climbing
    fn parse_expr_with_precedence(&mut self, min_precedence: u8) -> ParseResult<AstExpr> {
        let mut left = self.parse_unary_expr()?;

        while let Some((op, precedence)) = self.current_binary_op() {
            if precedence < min_precedence {
                break;
            }

            self.advance(); // consume operator
            self.skip_newlines();
            // `**` is right associative
            let next_min = if op == BinaryOp::Pow {
                precedence
            } else {
                precedence + 1
            };
            let right = self.parse_expr_with_precedence(next_min)?;
            let span = left.span.to(right.span);
            left = AstExpr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> ParseResult<AstExpr> {
        if self.check(&TokenKind::Not) {
            let start = self.current.span;
            self.advance();
            let expr = self.parse_unary_expr()?;
            let span = start.to(expr.span);
            return Ok(AstExpr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                },
                span,
            ));
        }

        let primary = self.parse_primary_expr()?;
        self.parse_postfix_expr(primary)
    }

    /// Index suffixes followed by an optional `++`/`--`
    fn parse_postfix_expr(&mut self, expr: AstExpr) -> ParseResult<AstExpr> {
        let expr = self.parse_index_suffix(expr)?;

        let op = match self.current.kind {
            TokenKind::Inc => IncDecOp::Inc,
            TokenKind::Dec => IncDecOp::Dec,
            _ => return Ok(expr),
        };
        let span = expr.span.to(self.current.span);
        self.advance();
        Ok(AstExpr::new(
            ExprKind::IncDec {
                op,
                target: Box::new(expr),
            },
            span,
        ))
    }

    /// `[a, b][c]` suffixes, flattened into one key list
    fn parse_index_suffix(&mut self, mut expr: AstExpr) -> ParseResult<AstExpr> {
        while self.check(&TokenKind::LBracket) {
            self.advance();
            self.skip_newlines();

            let mut new_keys = Vec::new();
            loop {
                new_keys.push(self.parse_expr()?);
                self.skip_newlines();
                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
                self.skip_newlines();
            }
            let close = self.expect(TokenKind::RBracket)?;
            let span = expr.span.to(close.span);

            expr = match expr.kind {
                ExprKind::Index { target, mut keys } => {
                    keys.extend(new_keys);
                    AstExpr::new(ExprKind::Index { target, keys }, span)
                }
                kind => AstExpr::new(
                    ExprKind::Index {
                        target: Box::new(AstExpr::new(kind, expr.span)),
                        keys: new_keys,
                    },
                    span,
                ),
            };
        }
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> ParseResult<AstExpr> {
        let span = self.current.span;
        let kind = match &self.current.kind {
            TokenKind::Int(n) => ExprKind::Int(*n),
            TokenKind::Float(n) => ExprKind::Float(*n),
            TokenKind::String(s) => ExprKind::Str(s.clone()),
            TokenKind::Duration(d) => ExprKind::Duration(*d),
            TokenKind::Ident(name) => ExprKind::Ident {
                name: name.clone(),
                symbol: None,
            },
            TokenKind::Capref(n) => ExprKind::Capref {
                name: n.to_string(),
                binding: None,
            },
            TokenKind::CaprefNamed(name) => ExprKind::Capref {
                name: name.clone(),
                binding: None,
            },
            TokenKind::Builtin(name) => {
                let name = name.clone();
                self.advance();
                return self.parse_builtin_call(name, span);
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.parse_expr()?;
                self.skip_newlines();
                self.expect(TokenKind::RParen)?;
                return Ok(expr);
            }
            TokenKind::Slash => return self.parse_pattern(),
            TokenKind::Invalid(message) => {
                return Err(self.enrich_error(ParseError::with_kind(
                    ErrorKind::InvalidToken,
                    message.clone(),
                    span,
                )));
            }
            TokenKind::Eof => {
                return Err(self.enrich_error(ParseError::with_kind(
                    ErrorKind::UnexpectedEof,
                    "Unexpected end of input, expected an expression",
                    span,
                )));
            }
            other => {
                return Err(self.enrich_error(ParseError::with_kind(
                    ErrorKind::InvalidExpression,
                    format!("Expected expression, found {}", other),
                    span,
                )));
            }
        };
        self.advance();
        Ok(AstExpr::new(kind, span))
    }

    /// `/regex/`; the current token is the opening slash
    fn parse_pattern(&mut self) -> ParseResult<AstExpr> {
        let open = self.current.span;
        self.lexer.expect_regex();
        self.advance();

        let pattern = match &self.current.kind {
            TokenKind::Regex(pattern) => pattern.clone(),
            TokenKind::Invalid(message) => {
                return Err(self.enrich_error(ParseError::with_kind(
                    ErrorKind::InvalidToken,
                    message.clone(),
                    self.current.span,
                )));
            }
            _ => {
                return Err(self.enrich_error(ParseError::expected(
                    TokenKind::Regex(String::new()),
                    self.current.clone(),
                )));
            }
        };
        self.advance();
        let close = self.expect(TokenKind::Slash)?;

        Ok(AstExpr::new(ExprKind::Pattern(pattern), open.to(close.span)))
    }

    /// Parse builtin call arguments (name already consumed)
    fn parse_builtin_call(&mut self, name: String, name_span: Span) -> ParseResult<AstExpr> {
        self.expect(TokenKind::LParen)?;
        self.skip_newlines();

        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                self.skip_newlines();
                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance(); // consume comma
                self.skip_newlines();
            }
        }

        let close = self.expect(TokenKind::RParen)?;
        Ok(AstExpr::new(
            ExprKind::Builtin { name, args },
            name_span.to(close.span),
        ))
    }

    /// Get the current binary operator and its precedence
    fn current_binary_op(&self) -> Option<(BinaryOp, u8)> {
        let (op, prec) = match &self.current.kind {
            TokenKind::Or => (BinaryOp::Or, 1),
            TokenKind::And => (BinaryOp::And, 2),
            TokenKind::BitOr => (BinaryOp::BitOr, 3),
            TokenKind::Xor => (BinaryOp::Xor, 4),
            TokenKind::BitAnd => (BinaryOp::BitAnd, 5),
            TokenKind::EqEq => (BinaryOp::Eq, 6),
            TokenKind::NotEq => (BinaryOp::NotEq, 6),
            TokenKind::Lt => (BinaryOp::Lt, 6),
            TokenKind::Gt => (BinaryOp::Gt, 6),
            TokenKind::LtEq => (BinaryOp::LtEq, 6),
            TokenKind::GtEq => (BinaryOp::GtEq, 6),
            TokenKind::Match => (BinaryOp::Match, 6),
            TokenKind::NotMatch => (BinaryOp::NotMatch, 6),
            TokenKind::Shl => (BinaryOp::Shl, 7),
            TokenKind::Shr => (BinaryOp::Shr, 7),
            TokenKind::Plus => (BinaryOp::Add, 8),
            TokenKind::Minus => (BinaryOp::Sub, 8),
            TokenKind::Star => (BinaryOp::Mul, 9),
            TokenKind::Slash => (BinaryOp::Div, 9),
            TokenKind::Percent => (BinaryOp::Mod, 9),
            TokenKind::Pow => (BinaryOp::Pow, 10),
            _ => return None,
        };
        Some((op, prec))
    }

    // ===== Token helpers =====

    /// Advance to the next token
    fn advance(&mut self) {
        self.current = self.lexer.next_token();
    }

    fn skip_newlines(&mut self) {
        while self.current.kind == TokenKind::Nl {
            self.advance();
        }
    }

    /// Check if current token matches a kind; payloads are ignored
    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(kind) == std::mem::discriminant(&self.current.kind)
    }

    /// Expect a specific token kind and advance
    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(&kind) {
            let tok = self.current.clone();
            self.advance();
            Ok(tok)
        } else {
            Err(self.enrich_error(ParseError::expected(kind, self.current.clone())))
        }
    }

    fn expect_ident(&mut self) -> ParseResult<(String, Span)> {
        let tok = self.expect(TokenKind::Ident(String::new()))?;
        match tok.kind {
            TokenKind::Ident(name) => Ok((name, tok.span)),
            _ => unreachable!("expect() only returns matching tokens"),
        }
    }
}
