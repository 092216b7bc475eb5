use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_SUITE_NAME_LEN: usize = 128;

/// Name of a registered suite. Only ASCII alphanumerics, `_` and `-` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SuiteName(String);

impl SuiteName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_SUITE_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidSuiteName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SuiteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SuiteName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        SuiteName::new(value)
    }
}

impl TryFrom<&str> for SuiteName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        SuiteName::new(value)
    }
}

impl From<SuiteName> for String {
    fn from(name: SuiteName) -> Self {
        name.0
    }
}

impl AsRef<str> for SuiteName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single scalar cell, as produced by the engine or written in a fixture.
///
/// `Numeric` keeps the decimal text exactly as written so that it can be compared
/// by value against other numeric cells without losing precision in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Numeric(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Numeric(s) => parse_numeric(s),
            _ => None,
        }
    }

    /// Golden-output equality: numeric cells compare by value, everything else
    /// (including numbers rendered as text) compares literally.
    pub fn matches(&self, other: &Value) -> bool {
        self.matches_with(other, ValueMatch::Normalized)
    }

    /// Equality under `matching`. Integers and decimals compare exactly; a float on
    /// either side falls back to `f64` comparison. `Strict` never equates cells of
    /// different kinds, but still treats `1.50` and `1.5` as the same numeric.
    pub fn matches_with(&self, other: &Value, matching: ValueMatch) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => floats_equal(*a, *b),
            (Value::Numeric(a), Value::Numeric(b)) => decimal_text_equal(a, b),
            (a, b) if matching == ValueMatch::Normalized && a.is_numeric() && b.is_numeric() => {
                numbers_equal(a, b)
            }
            (a, b) => a == b,
        }
    }

    fn decimal_text(&self) -> Option<String> {
        match self {
            Value::Int(i) => Some(i.to_string()),
            Value::Numeric(s) => Some(s.clone()),
            _ => None,
        }
    }
}

fn floats_equal(x: f64, y: f64) -> bool {
    (x.is_nan() && y.is_nan()) || x == y
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
        return match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => floats_equal(x, y),
            _ => false,
        };
    }
    match (a.decimal_text(), b.decimal_text()) {
        (Some(x), Some(y)) => decimal_text_equal(&x, &y),
        _ => false,
    }
}

fn decimal_text_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if let (Ok(x), Ok(y)) = (Decimal::from_str(a), Decimal::from_str(b)) {
        return x == y;
    }
    // Outside the range of `Decimal`, or a special value such as `NaN`.
    match (canonical_decimal(a), canonical_decimal(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Plain decimal text with redundant zeros and signs removed, or `None` for
/// anything that is not `[+-]digits[.digits]`.
fn canonical_decimal(text: &str) -> Option<String> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let is_zero = int_part == "0" && frac_part.is_empty();

    let mut out = String::with_capacity(text.len());
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    Some(out)
}

fn parse_numeric(s: &str) -> Option<f64> {
    match s.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Numeric(s) => write!(f, "{}::numeric", s),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => {
                f.write_str("\\x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    #[default]
    Exact,
    Unordered,
}

/// How cells are compared. `Normalized` compares numbers by value across integer,
/// decimal and float cells; `Strict` requires the same kind of cell and only
/// normalizes the formatting of decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatch {
    #[default]
    Normalized,
    Strict,
}

/// What a statement is expected to produce. Exactly one outcome per statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    /// Only checks that the statement did not error.
    Void,
    Rows {
        rows: Vec<Row>,
        order: RowOrder,
        matching: ValueMatch,
    },
    /// The engine error message must contain this substring.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionFileStatement {
    pub sql: String,
    pub expected: Expected,
    pub skip: bool,
}

impl RegressionFileStatement {
    pub fn void(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            expected: Expected::Void,
            skip: false,
        }
    }

    pub fn rows(sql: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            sql: sql.into(),
            expected: Expected::Rows {
                rows,
                order: RowOrder::Exact,
                matching: ValueMatch::Normalized,
            },
            skip: false,
        }
    }

    pub fn unordered_rows(sql: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            sql: sql.into(),
            expected: Expected::Rows {
                rows,
                order: RowOrder::Unordered,
                matching: ValueMatch::Normalized,
            },
            skip: false,
        }
    }

    pub fn error(sql: impl Into<String>, substring: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            expected: Expected::Error(substring.into()),
            skip: false,
        }
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Compares expected rows with [`ValueMatch::Strict`]. No effect on other
    /// expectations.
    pub fn strict(mut self) -> Self {
        if let Expected::Rows { matching, .. } = &mut self.expected {
            *matching = ValueMatch::Strict;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionFile {
    pub name: SuiteName,
    pub depends_on: Vec<SuiteName>,
    pub statements: Vec<RegressionFileStatement>,
    pub enabled: bool,
    pub tags: Vec<String>,
}

impl RegressionFile {
    pub fn new(name: SuiteName) -> Self {
        Self {
            name,
            depends_on: Vec::new(),
            statements: Vec::new(),
            enabled: true,
            tags: Vec::new(),
        }
    }

    pub fn named(name: &str) -> Result<Self> {
        Ok(Self::new(SuiteName::new(name)?))
    }

    /// Appends dependencies, keeping declaration order and dropping repeats.
    pub fn depends_on<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = SuiteName>,
    {
        for name in names {
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
        self
    }

    pub fn statement(mut self, statement: RegressionFileStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn statements<I>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = RegressionFileStatement>,
    {
        self.statements.extend(statements);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
