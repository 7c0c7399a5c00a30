//! Safe evaluation of test conditions
//!
//! Conditions are written in a small Python-like language: literals, variable
//! names, `and`/`or`/`not`, comparisons, membership and arithmetic. Calls,
//! attribute access, subscripts, assignment and other constructs outside the
//! whitelist are rejected at parse time, so evaluating an untrusted condition
//! can never touch anything but the variables it is given.

mod lexer;
mod parser;
mod value;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub use parser::{BinOp, CmpOp, Expr};
pub use value::Value;

/// Variables visible to an expression
pub type Context = HashMap<String, Value>;

/// Comparison and logical tokens that mark a string as a condition
const EXPRESSION_INDICATORS: &[&str] = &[
    "<", ">", "==", "!=", ">=", "<=", " and ", " or ", " not ", " in ",
];

/// Operators an expectation may start with; `value` is implied on the left
const LEADING_OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "<", ">", "in ", "not in "];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Invalid expression syntax at offset {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("Unsafe expression: {0} is not allowed")]
    Unsafe(String),

    #[error("Variable '{0}' is not defined")]
    UnboundVariable(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Expression too complex: {0}")]
    TooComplex(String),
}

/// Parses and evaluates conditions, caching parsed trees by source text
#[derive(Debug, Default)]
pub struct Evaluator {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source`, reusing a previously parsed tree when available
    pub fn compile(&self, source: &str) -> Result<Arc<Expr>, ExprError> {
        let source = source.trim();
        if let Some(expr) = self.lock().get(source) {
            return Ok(Arc::clone(expr));
        }

        let expr = Arc::new(parser::parse(source)?);
        self.lock().insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Evaluate `source` against `context`
    pub fn evaluate(&self, source: &str, context: &Context) -> Result<Value, ExprError> {
        let expr = self.compile(source)?;
        eval(&expr, context)
    }

    /// Evaluate and reduce to a truth value
    pub fn evaluate_bool(&self, source: &str, context: &Context) -> Result<bool, ExprError> {
        self.evaluate(source, context).map(|v| v.truthy())
    }

    /// Number of distinct parsed expressions held in the cache
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Expr>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check an observed value against an expectation
    ///
    /// Literal expectations compare by equality. Expressions are evaluated
    /// with `value`, `actual` and `x` bound to the observed value (and
    /// `expected` when given). Never fails: evaluation errors come back as a
    /// failed check whose description carries the error.
    pub fn evaluate_condition(
        &self,
        condition: &Value,
        actual: &Value,
        expected: Option<&Value>,
    ) -> (bool, String) {
        match Expectation::from_value(condition) {
            Expectation::Literal(literal) => {
                let passed = *actual == literal;
                (passed, format!("Expected {literal}, got {actual}"))
            }
            Expectation::Expression(source) => {
                let mut context = Context::new();
                context.insert("value".to_string(), actual.clone());
                context.insert("actual".to_string(), actual.clone());
                context.insert("x".to_string(), actual.clone());
                if let Some(expected) = expected {
                    context.insert("expected".to_string(), expected.clone());
                }

                let display = condition_text(condition);
                match self.evaluate_bool(&source, &context) {
                    Ok(passed) => (
                        passed,
                        format!("Condition '{display}' with value={actual}"),
                    ),
                    Err(e) => (false, format!("Failed to evaluate '{display}': {e}")),
                }
            }
        }
    }
}

/// How an expected value from a test suite is checked
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// Compare the observed value for equality
    Literal(Value),
    /// Evaluate as a condition over `value`
    Expression(String),
}

impl Expectation {
    /// Classify a value loaded from a suite file
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Str(text) => parse_expect_value(text),
            other => Expectation::Literal(other.clone()),
        }
    }
}

/// Decide whether an expectation string is a condition or a literal
///
/// A string containing a comparison, logical or membership operator is a
/// condition. One that starts with an operator is a condition on `value`,
/// so `"> 20"` reads as `value > 20`.
pub fn parse_expect_value(text: &str) -> Expectation {
    let trimmed = text.trim();

    // The trailing space on `in ` keeps `inactive` a literal
    if LEADING_OPERATORS.iter().any(|op| trimmed.starts_with(op)) {
        return Expectation::Expression(format!("value {trimmed}"));
    }

    if EXPRESSION_INDICATORS.iter().any(|ind| text.contains(ind)) {
        Expectation::Expression(trimmed.to_string())
    } else {
        Expectation::Literal(Value::parse_literal(text))
    }
}

fn condition_text(condition: &Value) -> String {
    match condition {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval(expr: &Expr, ctx: &Context) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnboundVariable(name.clone())),
        Expr::List(items) => Ok(Value::List(eval_all(items, ctx)?)),
        Expr::Tuple(items) => Ok(Value::Tuple(eval_all(items, ctx)?)),
        Expr::Set(items) => Ok(Value::set_from(eval_all(items, ctx)?)),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, ctx)?.truthy())),
        Expr::Neg(inner) => eval(inner, ctx)?.neg(),
        Expr::Pos(inner) => eval(inner, ctx)?.pos(),
        Expr::Binary { op, left, right } => {
            let l = eval(left, ctx)?;
            let r = eval(right, ctx)?;
            match op {
                BinOp::Add => l.add(&r),
                BinOp::Sub => l.sub(&r),
                BinOp::Mul => l.mul(&r),
                BinOp::Div => l.div(&r),
                BinOp::Mod => l.rem(&r),
            }
        }
        Expr::Compare { first, rest } => {
            let mut left = eval(first, ctx)?;
            for (op, right) in rest {
                let right = eval(right, ctx)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        // `and` / `or` yield the deciding operand, not a coerced bool
        Expr::And(operands) => {
            let mut last = Value::Bool(true);
            for operand in operands {
                last = eval(operand, ctx)?;
                if !last.truthy() {
                    break;
                }
            }
            Ok(last)
        }
        Expr::Or(operands) => {
            let mut last = Value::Bool(false);
            for operand in operands {
                last = eval(operand, ctx)?;
                if last.truthy() {
                    break;
                }
            }
            Ok(last)
        }
    }
}

fn eval_all(items: &[Expr], ctx: &Context) -> Result<Vec<Value>, ExprError> {
    items.iter().map(|item| eval(item, ctx)).collect()
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering::*;

    Ok(match op {
        CmpOp::Eq => left == right,
        CmpOp::NotEq => left != right,
        CmpOp::Lt => left.compare(right)? == Less,
        CmpOp::LtE => left.compare(right)? != Greater,
        CmpOp::Gt => left.compare(right)? == Greater,
        CmpOp::GtE => left.compare(right)? != Less,
        CmpOp::In => right.contains(left)?,
        CmpOp::NotIn => !right.contains(left)?,
    })
}
