//! Constant folding and dead branch removal
//!
//! Runs to a fixed point, bounded by [`MAX_PASSES`]. Works on both unchecked
//! and checked trees; folded nodes carry the type of their result.

use super::ast::*;
use super::error::{ErrorKind, ErrorList, ParseError};

const MAX_PASSES: usize = 16;

struct Optimizer {
    errors: ErrorList,
    changed: bool,
}

/// Optimise a program until no rewrite applies
pub fn optimize(mut program: AstProgram, filename: &str) -> Result<AstProgram, ErrorList> {
    let mut opt = Optimizer {
        errors: ErrorList::new(filename),
        changed: false,
    };

    for _ in 0..MAX_PASSES {
        opt.changed = false;
        program.statements = opt.fold_stmts(program.statements);
        if !opt.errors.is_empty() || !opt.changed {
            break;
        }
    }

    opt.errors.into_result(program)
}

fn literal_bool(expr: &AstExpr) -> Option<bool> {
    match expr.kind {
        ExprKind::Bool(b) => Some(b),
        _ => None,
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn literal_num(expr: &AstExpr) -> Option<Num> {
    match expr.kind {
        ExprKind::Int(n) => Some(Num::Int(n)),
        ExprKind::Float(n) => Some(Num::Float(n)),
        _ => None,
    }
}

impl Optimizer {
    fn fold_stmts(&mut self, stmts: Vec<AstStmt>) -> Vec<AstStmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match stmt {
                AstStmt::Cond {
                    cond,
                    then,
                    else_branch,
                    span,
                } => {
                    let cond = self.fold_expr(cond);
                    match literal_bool(&cond) {
                        Some(false) => {
                            self.changed = true;
                            if let Some(else_branch) = else_branch {
                                out.extend(self.fold_stmts(else_branch.stmts));
                            }
                        }
                        Some(true) if else_branch.is_some() => {
                            self.changed = true;
                            out.push(AstStmt::Cond {
                                cond,
                                then: self.fold_block(then),
                                else_branch: None,
                                span,
                            });
                        }
                        _ => out.push(AstStmt::Cond {
                            cond,
                            then: self.fold_block(then),
                            else_branch: else_branch.map(|b| self.fold_block(b)),
                            span,
                        }),
                    }
                }
                AstStmt::Otherwise { body, span } => out.push(AstStmt::Otherwise {
                    body: self.fold_block(body),
                    span,
                }),
                AstStmt::Deco {
                    name,
                    body,
                    expanded,
                    span,
                } => out.push(AstStmt::Deco {
                    name,
                    body,
                    expanded: expanded.map(|b| self.fold_block(b)),
                    span,
                }),
                AstStmt::Expr(expr) => out.push(AstStmt::Expr(self.fold_expr(expr))),
                other => out.push(other),
            }
        }
        out
    }

    fn fold_block(&mut self, block: Block) -> Block {
        Block {
            stmts: self.fold_stmts(block.stmts),
            span: block.span,
        }
    }

    fn fold_exprs(&mut self, exprs: Vec<AstExpr>) -> Vec<AstExpr> {
        exprs.into_iter().map(|e| self.fold_expr(e)).collect()
    }

    fn fold_expr(&mut self, expr: AstExpr) -> AstExpr {
        let AstExpr { kind, span, ty } = expr;
        let kind = match kind {
            ExprKind::Binary { op, left, right } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);
                if let Some(folded) = self.fold_binary(op, &left, &right, span) {
                    self.changed = true;
                    return folded;
                }
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            ExprKind::Unary { op, expr } => {
                let inner = self.fold_expr(*expr);
                match inner.kind {
                    ExprKind::Bool(b) => {
                        self.changed = true;
                        return AstExpr::typed(ExprKind::Bool(!b), span, Type::Bool);
                    }
                    ExprKind::Int(n) => {
                        self.changed = true;
                        return AstExpr::typed(ExprKind::Int(!n), span, Type::Int);
                    }
                    _ => ExprKind::Unary {
                        op,
                        expr: Box::new(inner),
                    },
                }
            }
            ExprKind::Convert { op, expr } => {
                let inner = self.fold_expr(*expr);
                if let Some(folded) = fold_conversion(op, &inner, span) {
                    self.changed = true;
                    return folded;
                }
                ExprKind::Convert {
                    op,
                    expr: Box::new(inner),
                }
            }
            ExprKind::Index { target, keys } => ExprKind::Index {
                target,
                keys: self.fold_exprs(keys),
            },
            ExprKind::Assign { op, target, value } => ExprKind::Assign {
                op,
                target: Box::new(self.fold_expr(*target)),
                value: Box::new(self.fold_expr(*value)),
            },
            ExprKind::IncDec { op, target } => ExprKind::IncDec {
                op,
                target: Box::new(self.fold_expr(*target)),
            },
            ExprKind::Builtin { name, args } => ExprKind::Builtin {
                name,
                args: self.fold_exprs(args),
            },
            other => other,
        };
        AstExpr { kind, span, ty }
    }

    fn fold_binary(
        &mut self,
        op: BinaryOp,
        left: &AstExpr,
        right: &AstExpr,
        span: super::lexer::Span,
    ) -> Option<AstExpr> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let (l, r) = (literal_bool(left)?, literal_bool(right)?);
            let b = if op == BinaryOp::And { l && r } else { l || r };
            return Some(AstExpr::typed(ExprKind::Bool(b), span, Type::Bool));
        }

        if op.is_comparison()
            && let (ExprKind::Str(l), ExprKind::Str(r)) = (&left.kind, &right.kind)
        {
            let ord = l.cmp(r);
            return Some(AstExpr::typed(
                ExprKind::Bool(compare(op, ord)),
                span,
                Type::Bool,
            ));
        }

        let (l, r) = (literal_num(left)?, literal_num(right)?);

        if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
            let zero = match r {
                Num::Int(n) => n == 0,
                Num::Float(n) => n == 0.0,
            };
            if zero {
                self.errors.push(ParseError::with_kind(
                    ErrorKind::InvalidExpression,
                    if op == BinaryOp::Div {
                        "Division by zero"
                    } else {
                        "Modulus by zero"
                    },
                    span,
                ));
                return None;
            }
        }

        match (l, r) {
            (Num::Int(a), Num::Int(b)) => fold_int(op, a, b, span),
            (a, b) => {
                let a = match a {
                    Num::Int(n) => n as f64,
                    Num::Float(n) => n,
                };
                let b = match b {
                    Num::Int(n) => n as f64,
                    Num::Float(n) => n,
                };
                fold_float(op, a, b, span)
            }
        }
    }
}

fn compare(op: BinaryOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinaryOp::Lt => ord == Less,
        BinaryOp::Gt => ord == Greater,
        BinaryOp::LtEq => ord != Greater,
        BinaryOp::GtEq => ord != Less,
        BinaryOp::Eq => ord == Equal,
        _ => ord != Equal,
    }
}

fn fold_int(op: BinaryOp, a: i64, b: i64, span: super::lexer::Span) -> Option<AstExpr> {
    let int = |n: i64| Some(AstExpr::typed(ExprKind::Int(n), span, Type::Int));
    match op {
        BinaryOp::Add => int(a.wrapping_add(b)),
        BinaryOp::Sub => int(a.wrapping_sub(b)),
        BinaryOp::Mul => int(a.wrapping_mul(b)),
        BinaryOp::Div => int(a.wrapping_div(b)),
        BinaryOp::Mod => int(a.wrapping_rem(b)),
        BinaryOp::Pow => {
            let exp = u32::try_from(b).ok()?;
            int(a.wrapping_pow(exp))
        }
        BinaryOp::Shl => int(a.wrapping_shl(b as u32)),
        BinaryOp::Shr => int(a.wrapping_shr(b as u32)),
        BinaryOp::BitAnd => int(a & b),
        BinaryOp::BitOr => int(a | b),
        BinaryOp::Xor => int(a ^ b),
        op if op.is_comparison() => Some(AstExpr::typed(
            ExprKind::Bool(compare(op, a.cmp(&b))),
            span,
            Type::Bool,
        )),
        _ => None,
    }
}

fn fold_float(op: BinaryOp, a: f64, b: f64, span: super::lexer::Span) -> Option<AstExpr> {
    let float = |n: f64| Some(AstExpr::typed(ExprKind::Float(n), span, Type::Float));
    match op {
        BinaryOp::Add => float(a + b),
        BinaryOp::Sub => float(a - b),
        BinaryOp::Mul => float(a * b),
        BinaryOp::Div => float(a / b),
        BinaryOp::Mod => float(a % b),
        BinaryOp::Pow => float(a.powf(b)),
        op if op.is_comparison() => {
            let ord = a.partial_cmp(&b)?;
            Some(AstExpr::typed(
                ExprKind::Bool(compare(op, ord)),
                span,
                Type::Bool,
            ))
        }
        _ => None,
    }
}

fn fold_conversion(op: Conversion, inner: &AstExpr, span: super::lexer::Span) -> Option<AstExpr> {
    let kind = match (op, &inner.kind) {
        (Conversion::I2f, ExprKind::Int(n)) => ExprKind::Float(*n as f64),
        (Conversion::F2i, ExprKind::Float(n)) => ExprKind::Int(*n as i64),
        (Conversion::I2s, ExprKind::Int(n)) => ExprKind::Str(n.to_string()),
        (Conversion::F2s, ExprKind::Float(n)) => ExprKind::Str(n.to_string()),
        (Conversion::S2i, ExprKind::Str(s)) => ExprKind::Int(s.trim().parse().ok()?),
        (Conversion::S2f, ExprKind::Str(s)) => ExprKind::Float(s.trim().parse().ok()?),
        _ => return None,
    };
    Some(AstExpr::typed(kind, span, op.result_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn optimized(source: &str) -> AstProgram {
        let program = parse("test.mtail", source).unwrap();
        optimize(program, "test.mtail").unwrap()
    }

    fn assigned_value(program: &AstProgram, index: usize) -> ExprKind {
        let stmt = match &program.statements[index] {
            AstStmt::Cond { then, .. } => &then.stmts[0],
            other => other,
        };
        match stmt {
            AstStmt::Expr(AstExpr {
                kind: ExprKind::Assign { value, .. },
                ..
            }) => value.kind.clone(),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_fold_int_arithmetic() {
        let program = optimized("gauge g\n/x/ { g = 1 + 2 * 3 }\n");
        assert!(matches!(assigned_value(&program, 1), ExprKind::Int(7)));
    }

    #[test]
    fn test_fold_mixed_arithmetic() {
        let program = optimized("gauge g\n/x/ { g = 1 + 0.5 }\n");
        assert!(matches!(assigned_value(&program, 1), ExprKind::Float(f) if f == 1.5));
    }

    #[test]
    fn test_fold_pow_right_assoc() {
        let program = optimized("gauge g\n/x/ { g = 2 ** 3 ** 2 }\n");
        assert!(matches!(assigned_value(&program, 1), ExprKind::Int(512)));
    }

    #[test]
    fn test_fold_wraps() {
        let program = optimized("gauge g\n/x/ { g = 9223372036854775807 + 1 }\n");
        assert!(matches!(assigned_value(&program, 1), ExprKind::Int(i64::MIN)));
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let program = parse("t", "gauge g\n/x/ { g = 1 / 0 }\n").unwrap();
        let errors = optimize(program, "t").unwrap_err();
        assert!(errors.to_string().contains("Division by zero"));

        let program = parse("t", "gauge g\n/x/ { g = 1 % 0 }\n").unwrap();
        let errors = optimize(program, "t").unwrap_err();
        assert!(errors.to_string().contains("Modulus by zero"));
    }

    #[test]
    fn test_dead_branch_removed() {
        let program = optimized("counter c\n1 > 2 {\n  c++\n}\n");
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn test_false_branch_keeps_else() {
        let program = optimized("counter c\n1 == 2 {\n  c++\n} else {\n  c += 2\n}\n");
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[1], AstStmt::Expr(_)));
    }

    #[test]
    fn test_true_branch_drops_else() {
        let program = optimized("counter c\n2 >= 2 {\n  c++\n} else {\n  c += 2\n}\n");
        match &program.statements[1] {
            AstStmt::Cond {
                cond, else_branch, ..
            } => {
                assert!(matches!(cond.kind, ExprKind::Bool(true)));
                assert!(else_branch.is_none());
            }
            other => panic!("expected cond, got {:?}", other),
        }
    }

    #[test]
    fn test_fold_not_and_logic() {
        let program = optimized("counter c\n!(1 < 2) || 3 == 3 {\n  c++\n}\n");
        match &program.statements[1] {
            AstStmt::Cond { cond, .. } => assert!(matches!(cond.kind, ExprKind::Bool(true))),
            other => panic!("expected cond, got {:?}", other),
        }
    }

    #[test]
    fn test_patterns_untouched() {
        let program = optimized("counter c\n/a/ {\n  c++\n}\n");
        match &program.statements[1] {
            AstStmt::Cond { cond, .. } => assert!(matches!(cond.kind, ExprKind::Pattern(_))),
            other => panic!("expected cond, got {:?}", other),
        }
    }
}
