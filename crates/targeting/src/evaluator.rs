//! Targeting evaluator.
//!
//! Evaluation is pure: the same expression over the same [`TargetContext`]
//! always gives the same answer. Undefined facts make a predicate *unknown*;
//! unknown propagates through `NOT`, `AND` and `OR` with three-valued logic
//! and a final unknown counts as no match.

use converge_core::{CompareOp, Expr, FactValue, Literal, Predicate, TargetContext, Version};
use std::cmp::Ordering;

/// Errors raised while evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// The fact exists but its type does not fit the operator
    #[error("fact {fact:?} is {found}, cannot apply {operator}")]
    TypeMismatch {
        /// Fact name
        fact: String,
        /// Operator that was applied
        operator: String,
        /// Kind of the fact value
        found: &'static str,
    },
}

/// Kleene truth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

impl From<bool> for Truth {
    fn from(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

/// Evaluate `expr` against `ctx`. Unknown results are `false`.
///
/// A `tracing` warning names the undefined facts when the result is unknown.
pub fn evaluate(expr: &Expr, ctx: &TargetContext) -> Result<bool, EvalError> {
    match evaluate_tristate(expr, ctx)? {
        Some(matched) => Ok(matched),
        None => {
            let missing: Vec<&str> = expr
                .facts()
                .into_iter()
                .filter(|name| ctx.fact(name).is_none())
                .collect();
            tracing::warn!(
                target_id = %ctx.target(),
                missing = ?missing,
                "targeting depends on undefined facts, treating as no match"
            );
            Ok(false)
        }
    }
}

/// Evaluate `expr` keeping the unknown state: `None` means unknown.
pub fn evaluate_tristate(expr: &Expr, ctx: &TargetContext) -> Result<Option<bool>, EvalError> {
    Ok(match eval(expr, ctx)? {
        Truth::True => Some(true),
        Truth::False => Some(false),
        Truth::Unknown => None,
    })
}

fn eval(expr: &Expr, ctx: &TargetContext) -> Result<Truth, EvalError> {
    match expr {
        Expr::Const(b) => Ok((*b).into()),
        Expr::Not(inner) => Ok(eval(inner, ctx)?.not()),
        Expr::And(children) => {
            let mut acc = Truth::True;
            for child in children {
                match eval(child, ctx)? {
                    Truth::False => return Ok(Truth::False),
                    Truth::Unknown => acc = Truth::Unknown,
                    Truth::True => {}
                }
            }
            Ok(acc)
        }
        Expr::Or(children) => {
            let mut acc = Truth::False;
            for child in children {
                match eval(child, ctx)? {
                    Truth::True => return Ok(Truth::True),
                    Truth::Unknown => acc = Truth::Unknown,
                    Truth::False => {}
                }
            }
            Ok(acc)
        }
        Expr::Predicate(p) => eval_predicate(p, ctx),
    }
}

fn eval_predicate(p: &Predicate, ctx: &TargetContext) -> Result<Truth, EvalError> {
    if let Predicate::Exists { fact } = p {
        return Ok(ctx.fact(fact).is_some().into());
    }
    let Some(value) = ctx.fact(p.fact()) else {
        return Ok(Truth::Unknown);
    };

    let matched = match p {
        Predicate::Compare { fact, op, value: literal } => match op {
            CompareOp::Eq => scalar_eq(fact, "==", value, literal)?,
            CompareOp::NotEq => !scalar_eq(fact, "!=", value, literal)?,
            ordering => {
                let ord = compare_ordered(fact, *ordering, value, literal)?;
                match ordering {
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::LtEq => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }
            }
        },
        Predicate::Contains { fact, value: literal } => match value {
            FactValue::List(members) => {
                let wanted = literal.as_text();
                members.iter().any(|m| m.eq_ignore_ascii_case(&wanted))
            }
            other => return Err(mismatch(fact, "contains", other)),
        },
        Predicate::In { fact, values } => {
            if matches!(value, FactValue::List(_)) {
                return Err(mismatch(fact, "in", value));
            }
            let mut any = false;
            for candidate in values {
                if scalar_eq(fact, "in", value, candidate)? {
                    any = true;
                    break;
                }
            }
            any
        }
        Predicate::Exists { .. } => true,
    };
    Ok(matched.into())
}

fn mismatch(fact: &str, operator: &str, value: &FactValue) -> EvalError {
    EvalError::TypeMismatch {
        fact: fact.to_string(),
        operator: operator.to_string(),
        found: value.kind(),
    }
}

fn scalar_eq(fact: &str, operator: &str, value: &FactValue, literal: &Literal) -> Result<bool, EvalError> {
    match value {
        FactValue::Text(text) => Ok(text.eq_ignore_ascii_case(&literal.as_text())),
        FactValue::Bool(b) => match literal {
            Literal::Bool(l) => Ok(b == l),
            other => match other.as_text().to_ascii_lowercase().as_str() {
                "true" => Ok(*b),
                "false" => Ok(!*b),
                _ => Err(mismatch(fact, operator, value)),
            },
        },
        FactValue::Number(n) => match literal.as_text().parse::<f64>() {
            Ok(l) => Ok(*n == l),
            Err(_) => Err(mismatch(fact, operator, value)),
        },
        FactValue::List(_) => Err(mismatch(fact, operator, value)),
    }
}

fn compare_ordered(
    fact: &str,
    op: CompareOp,
    value: &FactValue,
    literal: &Literal,
) -> Result<Ordering, EvalError> {
    let symbol = op_symbol(op);
    let rhs = literal.as_text();
    match value {
        FactValue::Number(n) => rhs
            .parse::<f64>()
            .ok()
            .and_then(|l| n.partial_cmp(&l))
            .ok_or_else(|| mismatch(fact, symbol, value)),
        FactValue::Text(text) => {
            if let (Some(a), Some(b)) = (Version::parse(text), Version::parse(&rhs)) {
                return Ok(a.cmp(&b));
            }
            match (text.trim().parse::<f64>(), rhs.parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b).ok_or_else(|| mismatch(fact, symbol, value)),
                _ => Err(mismatch(fact, symbol, value)),
            }
        }
        FactValue::Bool(_) | FactValue::List(_) => Err(mismatch(fact, symbol, value)),
    }
}

fn op_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::NotEq => "!=",
        CompareOp::Lt => "<",
        CompareOp::LtEq => "<=",
        CompareOp::Gt => ">",
        CompareOp::GtEq => ">=",
    }
}
