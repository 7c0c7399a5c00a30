//! Dynamic values shared by the evaluator, the signal client and reports

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ExprError;

/// A signal or expression value
///
/// Serializes untagged: `null`, booleans, numbers, strings and arrays.
/// Tuples and sets only arise from expression literals and serialize as arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    #[serde(skip_deserializing)]
    Tuple(Vec<Value>),
    #[serde(skip_deserializing)]
    Set(Vec<Value>),
}

impl Value {
    /// Parse a bare literal the way expectation values are written in suites
    ///
    /// Numbers (a `.` selects float), `true`/`false`, `none`/`null`
    /// (case-insensitive); anything else is kept as a string.
    pub fn parse_literal(text: &str) -> Self {
        let trimmed = text.trim();
        let number = if trimmed.contains('.') {
            trimmed.parse::<f64>().ok().map(Value::Float)
        } else {
            trimmed.parse::<i64>().ok().map(Value::Int)
        };
        if let Some(number) = number {
            return number;
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "none" | "null" => Value::None,
            _ => Value::Str(text.to_string()),
        }
    }

    /// Name of the value's type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
        }
    }

    /// Python-style truthiness
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => !items.is_empty(),
        }
    }

    /// Numeric view; bools count as 0/1
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    /// Build a set literal, dropping duplicates while keeping first-seen order
    pub fn set_from(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }

    /// Ordering for `<`, `<=`, `>`, `>=`
    pub fn compare(&self, other: &Value) -> Result<Ordering, ExprError> {
        if self.is_numeric() && other.is_numeric() {
            if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
                return Ok(a.cmp(&b));
            }
            let (a, b) = (self.as_f64().unwrap_or(f64::NAN), other.as_f64().unwrap_or(f64::NAN));
            return a
                .partial_cmp(&b)
                .ok_or_else(|| ExprError::Type("cannot order NaN".to_string()));
        }

        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    if x != y {
                        return x.compare(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(ExprError::Type(format!(
                "'<' not supported between {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Membership test for `in` / `not in`
    pub fn contains(&self, needle: &Value) -> Result<bool, ExprError> {
        match self {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                Ok(items.iter().any(|item| item == needle))
            }
            Value::Str(haystack) => match needle {
                Value::Str(n) => Ok(haystack.contains(n.as_str())),
                other => Err(ExprError::Type(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            other => Err(ExprError::Type(format!(
                "argument of type {} is not iterable",
                other.type_name()
            ))),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) => Ok(Value::List([a.clone(), b.clone()].concat())),
            (Value::Tuple(a), Value::Tuple(b)) => {
                Ok(Value::Tuple([a.clone(), b.clone()].concat()))
            }
            _ => self.arith(other, "+", i64::checked_add, |a, b| a + b),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, ExprError> {
        self.arith(other, "-", i64::checked_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, ExprError> {
        self.arith(other, "*", i64::checked_mul, |a, b| a * b)
    }

    /// True division, always a float
    pub fn div(&self, other: &Value) -> Result<Value, ExprError> {
        let (a, b) = self.numeric_pair(other, "/")?;
        if b == 0.0 {
            return Err(ExprError::DivisionByZero);
        }
        Ok(Value::Float(a / b))
    }

    /// Modulo with the sign of the divisor
    pub fn rem(&self, other: &Value) -> Result<Value, ExprError> {
        if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
            if b == 0 {
                return Err(ExprError::DivisionByZero);
            }
            let r = a.wrapping_rem(b);
            return Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }));
        }
        let (a, b) = self.numeric_pair(other, "%")?;
        if b == 0.0 {
            return Err(ExprError::DivisionByZero);
        }
        let r = a % b;
        Ok(Value::Float(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }))
    }

    pub fn neg(&self) -> Result<Value, ExprError> {
        match self {
            Value::Float(f) => Ok(Value::Float(-f)),
            other => other
                .as_i64()
                .and_then(i64::checked_neg)
                .map(Value::Int)
                .ok_or_else(|| {
                    ExprError::Type(format!("bad operand type for unary -: {}", self.type_name()))
                }),
        }
    }

    pub fn pos(&self) -> Result<Value, ExprError> {
        match self {
            Value::Float(f) => Ok(Value::Float(*f)),
            other => other
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| {
                    ExprError::Type(format!("bad operand type for unary +: {}", self.type_name()))
                }),
        }
    }

    fn numeric_pair(&self, other: &Value, op: &str) -> Result<(f64, f64), ExprError> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(ExprError::Type(format!(
                "unsupported operand types for {op}: {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    fn arith(
        &self,
        other: &Value,
        op: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Value, ExprError> {
        if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
            if let Some(result) = int_op(a, b) {
                return Ok(Value::Int(result));
            }
        }
        let (a, b) = self.numeric_pair(other, op)?;
        Ok(Value::Float(float_op(a, b)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.is_numeric() && other.is_numeric() {
            return match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a == b,
                _ => self.as_f64() == other.as_f64(),
            };
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(items: &[Value]) -> String {
            items
                .iter()
                .map(|item| match item {
                    Value::Str(s) => format!("'{s}'"),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ")
        }

        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => write!(f, "[{}]", join(items)),
            Value::Tuple(items) if items.len() == 1 => write!(f, "({},)", join(items)),
            Value::Tuple(items) => write!(f, "({})", join(items)),
            Value::Set(items) => write!(f, "{{{}}}", join(items)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
