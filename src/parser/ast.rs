//! Abstract Syntax Tree for hogtail programs

use super::lexer::Span;
use crate::store::Kind;
use chrono::TimeDelta;
use std::fmt;

/// Top-level AST node representing one program file
#[derive(Debug, Clone)]
pub struct AstProgram {
    pub statements: Vec<AstStmt>,
    pub span: Span,
}

/// A `{ ... }` statement list
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<AstStmt>,
    pub span: Span,
}

/// Metric declaration
#[derive(Debug, Clone)]
pub struct Decl {
    pub kind: Kind,
    pub name: String,
    pub exported_name: Option<String>,
    pub keys: Vec<String>,
    pub buckets: Vec<f64>,
    pub limit: Option<usize>,
    pub hidden: bool,
    pub span: Span,
}

impl Decl {
    /// Name the metric is published under
    pub fn export_name(&self) -> &str {
        self.exported_name.as_deref().unwrap_or(&self.name)
    }
}

/// Statements
#[derive(Debug, Clone)]
pub enum AstStmt {
    Decl(Decl),
    /// `const NAME /pattern/`
    Const {
        name: String,
        pattern: AstExpr,
        span: Span,
    },
    /// `cond { ... } else { ... }`, including bare pattern actions
    Cond {
        cond: AstExpr,
        then: Block,
        else_branch: Option<Block>,
        span: Span,
    },
    Otherwise {
        body: Block,
        span: Span,
    },
    /// `def name { ... next ... }`
    DecoDef {
        name: String,
        body: Block,
        span: Span,
    },
    /// `@name { ... }`; `expanded` is filled in by the checker
    Deco {
        name: String,
        body: Block,
        expanded: Option<Block>,
        span: Span,
    },
    Next {
        span: Span,
    },
    Stop {
        span: Span,
    },
    /// `del metric[keys] [after duration]`
    Del {
        target: AstExpr,
        expiry: Option<TimeDelta>,
        span: Span,
    },
    Expr(AstExpr),
}

impl AstStmt {
    pub fn span(&self) -> Span {
        match self {
            AstStmt::Decl(decl) => decl.span,
            AstStmt::Expr(expr) => expr.span,
            AstStmt::Const { span, .. }
            | AstStmt::Cond { span, .. }
            | AstStmt::Otherwise { span, .. }
            | AstStmt::DecoDef { span, .. }
            | AstStmt::Deco { span, .. }
            | AstStmt::Next { span }
            | AstStmt::Stop { span }
            | AstStmt::Del { span, .. } => *span,
        }
    }
}

/// Static types assigned by the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// Not yet checked
    Undef,
    /// Statement-like expressions that leave nothing usable behind
    None,
    Int,
    Float,
    String,
    Bool,
    Pattern,
    Duration,
}

impl Type {
    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }
}

/// What an identifier resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// Index into the program's metric table
    Metric(usize),
    /// A `const` pattern fragment
    Const,
}

/// The regex group a capture reference reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaprefBinding {
    /// Source of the pattern that defines the group
    pub pattern: String,
    pub group: usize,
}

/// Expressions
#[derive(Debug, Clone)]
pub struct AstExpr {
    pub kind: ExprKind,
    pub span: Span,
    pub ty: Type,
}

impl AstExpr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        AstExpr {
            kind,
            span,
            ty: Type::Undef,
        }
    }

    pub fn typed(kind: ExprKind, span: Span, ty: Type) -> Self {
        AstExpr { kind, span, ty }
    }

    /// True for literals the optimizer can fold
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::Str(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Duration(TimeDelta),
    /// Regular expression source
    Pattern(String),

    Ident {
        name: String,
        symbol: Option<Symbol>,
    },
    /// `$1` or `$name`
    Capref {
        name: String,
        binding: Option<CaprefBinding>,
    },
    /// `metric[k1, k2]`
    Index {
        target: Box<AstExpr>,
        keys: Vec<AstExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<AstExpr>,
        right: Box<AstExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<AstExpr>,
    },
    Assign {
        op: AssignOp,
        target: Box<AstExpr>,
        value: Box<AstExpr>,
    },
    IncDec {
        op: IncDecOp,
        target: Box<AstExpr>,
    },
    Builtin {
        name: String,
        args: Vec<AstExpr>,
    },
    /// Coercion inserted by the checker
    Convert {
        op: Conversion,
        expr: Box<AstExpr>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,

    // Bitwise
    Shl,
    Shr,
    BitAnd,
    BitOr,
    Xor,

    // Comparison
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    NotEq,
    Match,
    NotMatch,

    // Logical
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Gt
                | BinaryOp::LtEq
                | BinaryOp::GtEq
                | BinaryOp::Eq
                | BinaryOp::NotEq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Pow
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::Xor
        )
    }
}

/// Unary operators; `!` and `~` share one token and the checker picks
/// logical or bitwise negation from the operand type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDecOp {
    Inc,
    Dec,
}

/// Value conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    S2i,
    S2f,
    I2f,
    I2s,
    F2s,
    F2i,
}

impl Conversion {
    pub fn result_type(self) -> Type {
        match self {
            Conversion::S2i | Conversion::F2i => Type::Int,
            Conversion::S2f | Conversion::I2f => Type::Float,
            Conversion::I2s | Conversion::F2s => Type::String,
        }
    }
}

// Display implementations for debugging and diagnostics

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Match => "=~",
            BinaryOp::NotMatch => "!~",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::Undef => "undefined",
            Type::None => "none",
            Type::Int => "Int",
            Type::Float => "Float",
            Type::String => "String",
            Type::Bool => "Bool",
            Type::Pattern => "Pattern",
            Type::Duration => "Duration",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::lexer::Position;

    fn dummy_span() -> Span {
        Span::new(Position::start(), Position::start())
    }

    #[test]
    fn test_binary_op_display() {
        assert_eq!(BinaryOp::Add.to_string(), "+");
        assert_eq!(BinaryOp::Eq.to_string(), "==");
        assert_eq!(BinaryOp::Match.to_string(), "=~");
        assert_eq!(BinaryOp::Pow.to_string(), "**");
    }

    #[test]
    fn test_binary_op_classes() {
        assert!(BinaryOp::LtEq.is_comparison());
        assert!(!BinaryOp::Match.is_comparison());
        assert!(BinaryOp::Mod.is_arithmetic());
        assert!(BinaryOp::Xor.is_bitwise());
        assert!(!BinaryOp::And.is_bitwise());
    }

    #[test]
    fn test_conversion_result_types() {
        assert_eq!(Conversion::S2i.result_type(), Type::Int);
        assert_eq!(Conversion::I2f.result_type(), Type::Float);
        assert_eq!(Conversion::F2s.result_type(), Type::String);
    }

    #[test]
    fn test_new_expr_is_unchecked() {
        let expr = AstExpr::new(ExprKind::Int(42), dummy_span());
        assert_eq!(expr.ty, Type::Undef);
        assert!(expr.is_literal());
    }

    #[test]
    fn test_decl_export_name() {
        let mut decl = Decl {
            kind: Kind::Counter,
            name: "lines".to_string(),
            exported_name: None,
            keys: vec![],
            buckets: vec![],
            limit: None,
            hidden: false,
            span: dummy_span(),
        };
        assert_eq!(decl.export_name(), "lines");
        decl.exported_name = Some("lines_total".to_string());
        assert_eq!(decl.export_name(), "lines_total");
    }

    #[test]
    fn test_stmt_span() {
        let span = dummy_span();
        let stmt = AstStmt::Stop { span };
        assert_eq!(stmt.span(), span);
    }
}
