// ABOUTME: In-memory tabular buffer (rows x named columns) and its cell values
// ABOUTME: Provides canonical cell equality used by dedup and identity remapping

use anyhow::{bail, Result};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single cell read from a table or a staged file.
///
/// Equality and hashing are canonical rather than structural: `Bool(true)`,
/// `Int(1)` and `Float(1.0)` are the same value. Engines and staging formats do
/// not agree on physical types, so a row that went SQLite -> JSON -> Postgres
/// must still compare equal to itself.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(PartialEq, Eq, Hash)]
enum Canonical<'a> {
    Null,
    Int(i64),
    Float(u64),
    Text(&'a str),
    Bytes(&'a [u8]),
}

// 2^63 as f64; anything at or beyond it cannot be an i64
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

impl Value {
    fn canonical(&self) -> Canonical<'_> {
        match self {
            Value::Null => Canonical::Null,
            Value::Bool(b) => Canonical::Int(i64::from(*b)),
            Value::Int(i) => Canonical::Int(*i),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && *f >= -I64_BOUND && *f < I64_BOUND {
                    Canonical::Int(*f as i64)
                } else {
                    Canonical::Float(f.to_bits())
                }
            }
            Value::Text(s) => Canonical::Text(s),
            Value::Bytes(b) => Canonical::Bytes(b),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse text that a backend handed back for a numeric column.
    ///
    /// Falls back to `Text` when the string is not a number.
    pub fn parse_numeric(text: &str) -> Value {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => Value::Text(text.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) => match Value::Float(*f).canonical() {
                Canonical::Int(i) => Some(i),
                _ => None,
            },
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Some(true),
                "false" | "f" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Render as text; `None` only for `Null`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            other => Some(other.to_string()),
        }
    }

    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bytes(b) => Some(b.clone()),
            Value::Text(s) => Some(s.as_bytes().to_vec()),
            other => other.to_text().map(String::into_bytes),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
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

/// Rows x named columns, owned by the export or import step that produced it.
///
/// Transformations consume the buffer and return a new one instead of editing
/// in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBuffer {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TabularBuffer {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a buffer, checking every row has one cell per column.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut buffer = Self::new(columns);
        for row in rows {
            buffer.push_row(row)?;
        }
        Ok(buffer)
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "Row has {} cells but buffer has {} columns",
                row.len(),
                self.columns.len()
            );
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Resolve column names to positions, failing on the first missing one.
    pub fn indices_of(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Column '{}' not present (available: {})",
                        name,
                        self.columns.join(", ")
                    )
                })
            })
            .collect()
    }

    /// Remove a column, returning the remaining buffer and the removed values.
    ///
    /// The removed values are `None` when the column was not present.
    pub fn split_off_column(self, name: &str) -> (TabularBuffer, Option<Vec<Value>>) {
        let Some(idx) = self.column_index(name) else {
            return (self, None);
        };

        let mut columns = self.columns;
        columns.remove(idx);

        let mut removed = Vec::with_capacity(self.rows.len());
        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                removed.push(row.remove(idx));
                row
            })
            .collect();

        (TabularBuffer { columns, rows }, Some(removed))
    }

    /// Keep only the rows whose position is flagged `true`.
    pub fn retain_mask(self, keep: &[bool]) -> TabularBuffer {
        let rows = self
            .rows
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(row, keep)| keep.then_some(row))
            .collect();
        TabularBuffer {
            columns: self.columns,
            rows,
        }
    }

    /// Replace every value in one column through `rewrite`.
    pub fn map_column<F>(self, name: &str, mut rewrite: F) -> TabularBuffer
    where
        F: FnMut(Value) -> Value,
    {
        let Some(idx) = self.column_index(name) else {
            return self;
        };
        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                let old = std::mem::replace(&mut row[idx], Value::Null);
                row[idx] = rewrite(old);
                row
            })
            .collect();
        TabularBuffer {
            columns: self.columns,
            rows,
        }
    }
}

/// Project a row onto the given positions.
pub fn row_key(row: &[Value], indices: &[usize]) -> Vec<Value> {
    indices.iter().map(|&i| row[i].clone()).collect()
}
