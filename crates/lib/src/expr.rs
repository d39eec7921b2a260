//! The expression AST used by plan predicates and projections.
//!
//! Plans arrive from the upstream optimizer with predicates in conjunctive
//! normal form. The backend only ever needs two evaluation facets: constant
//! folding (for the result-set reader, which must produce the values of
//! constant columns without touching guest memory) and a syntactic walk (for
//! literal collection and code generation).

use crate::types::Type;
use crate::value::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal. `value` is `None` exactly when `ty` is [`Type::None`],
    /// i.e. for the `NULL` literal.
    Constant { value: Option<Value>, ty: Type },
    /// A designator referring to a column of the child schema.
    Column { id: String, ty: Type },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
        ty: Type,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        ty: Type,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("expression is not constant")]
    NotConstant,
    #[error("division by zero in constant expression")]
    DivisionByZero,
    #[error("type mismatch in constant expression")]
    TypeMismatch,
}

impl Expr {
    pub fn int(v: i64) -> Expr {
        Expr::Constant {
            value: Some(Value::Int(v)),
            ty: Type::I32,
        }
    }

    pub fn str(s: impl Into<String>) -> Expr {
        let s = s.into();
        let n = s.len();
        Expr::Constant {
            value: Some(Value::Str(s)),
            ty: Type::Char(n),
        }
    }

    pub fn null() -> Expr {
        Expr::Constant {
            value: None,
            ty: Type::None,
        }
    }

    pub fn column(id: impl Into<String>, ty: Type) -> Expr {
        Expr::Column { id: id.into(), ty }
    }

    pub fn cmp(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            ty: Type::Bool,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Expr::Constant { ty, .. }
            | Expr::Column { ty, .. }
            | Expr::Unary { ty, .. }
            | Expr::Binary { ty, .. } => *ty,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant { .. })
    }

    /// Folds a constant expression to its value; `Ok(None)` is the NULL
    /// literal. Designators make an expression non-constant.
    pub fn eval_const(&self) -> Result<Option<Value>, EvalError> {
        match self {
            Expr::Constant { value, .. } => Ok(value.clone()),
            Expr::Column { .. } => Err(EvalError::NotConstant),
            Expr::Unary { op, expr, .. } => {
                let v = expr.eval_const()?.ok_or(EvalError::TypeMismatch)?;
                match (op, v) {
                    (UnOp::Neg, Value::Int(i)) => Ok(Some(Value::Int(-i))),
                    (UnOp::Neg, Value::Float(f)) => Ok(Some(Value::Float(-f))),
                    (UnOp::Not, Value::Bool(b)) => Ok(Some(Value::Bool(!b))),
                    _ => Err(EvalError::TypeMismatch),
                }
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let l = lhs.eval_const()?.ok_or(EvalError::TypeMismatch)?;
                let r = rhs.eval_const()?.ok_or(EvalError::TypeMismatch)?;
                eval_binary(*op, l, r)
            }
        }
    }

    /// Collects every string literal occurring in this expression.
    pub fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Constant {
                value: Some(Value::Str(s)),
                ..
            } => out.push(s),
            Expr::Constant { .. } | Expr::Column { .. } => {}
            Expr::Unary { expr, .. } => expr.collect_strings(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_strings(out);
                rhs.collect_strings(out);
            }
        }
    }
}

fn eval_binary(op: BinOp, l: Value, r: Value) -> Result<Option<Value>, EvalError> {
    use BinOp::*;
    let v = match (op, &l, &r) {
        (Add, Value::Int(a), Value::Int(b)) => Value::Int(a + b),
        (Sub, Value::Int(a), Value::Int(b)) => Value::Int(a - b),
        (Mul, Value::Int(a), Value::Int(b)) => Value::Int(a * b),
        (Div, Value::Int(_), Value::Int(0)) => return Err(EvalError::DivisionByZero),
        (Div, Value::Int(a), Value::Int(b)) => Value::Int(a / b),
        (Add, Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (Sub, Value::Float(a), Value::Float(b)) => Value::Float(a - b),
        (Mul, Value::Float(a), Value::Float(b)) => Value::Float(a * b),
        (Div, Value::Float(a), Value::Float(b)) => Value::Float(a / b),
        (Eq, a, b) => Value::Bool(a == b),
        (Ne, a, b) => Value::Bool(a != b),
        (Lt, Value::Int(a), Value::Int(b)) => Value::Bool(a < b),
        (Le, Value::Int(a), Value::Int(b)) => Value::Bool(a <= b),
        (Gt, Value::Int(a), Value::Int(b)) => Value::Bool(a > b),
        (Ge, Value::Int(a), Value::Int(b)) => Value::Bool(a >= b),
        (Lt, Value::Float(a), Value::Float(b)) => Value::Bool(a < b),
        (Le, Value::Float(a), Value::Float(b)) => Value::Bool(a <= b),
        (Gt, Value::Float(a), Value::Float(b)) => Value::Bool(a > b),
        (Ge, Value::Float(a), Value::Float(b)) => Value::Bool(a >= b),
        _ => return Err(EvalError::TypeMismatch),
    };
    Ok(Some(v))
}

/// One disjunction of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clause(pub Vec<Expr>);

/// A predicate in conjunctive normal form: a conjunction of [`Clause`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cnf(pub Vec<Clause>);

impl Cnf {
    /// A CNF with a single single-predicate clause.
    pub fn single(pred: Expr) -> Cnf {
        Cnf(vec![Clause(vec![pred])])
    }

    /// A CNF with a single clause of disjuncts.
    pub fn any_of(preds: Vec<Expr>) -> Cnf {
        Cnf(vec![Clause(preds)])
    }

    pub fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        for clause in &self.0 {
            for pred in &clause.0 {
                pred.collect_strings(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_folding() {
        let e = Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(Expr::int(40)),
            rhs: Box::new(Expr::int(2)),
            ty: Type::I32,
        };
        assert_eq!(e.eval_const().unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn null_literal_folds_to_none() {
        assert_eq!(Expr::null().eval_const().unwrap(), None);
    }

    #[test]
    fn designator_is_not_constant() {
        let e = Expr::column("t.id", Type::I32);
        assert_eq!(e.eval_const(), Err(EvalError::NotConstant));
    }

    #[test]
    fn division_by_zero_is_reported() {
        let e = Expr::Binary {
            op: BinOp::Div,
            lhs: Box::new(Expr::int(1)),
            rhs: Box::new(Expr::int(0)),
            ty: Type::I32,
        };
        assert_eq!(e.eval_const(), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn string_collection_descends() {
        let e = Expr::cmp(
            BinOp::Eq,
            Expr::column("t.name", Type::Char(8)),
            Expr::str("alice"),
        );
        let mut out = Vec::new();
        e.collect_strings(&mut out);
        assert_eq!(out, vec!["alice"]);
    }
}
