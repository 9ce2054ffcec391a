//! Data types for KeeperMap tables.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Column types understood by the value codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    UInt64,
    Int64,
    Float64,
    String,
    Binary,
}

impl DataType {
    /// Returns the value a missing row reports for a column of this type.
    pub fn default_value(&self) -> Value {
        match self {
            DataType::Bool => Value::Bool(false),
            DataType::UInt64 => Value::UInt64(0),
            DataType::Int64 => Value::Int64(0),
            DataType::Float64 => Value::Float64(0.0),
            DataType::String => Value::String(String::new()),
            DataType::Binary => Value::Binary(Bytes::new()),
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    String(String),
    Binary(Bytes),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::UInt64(_) => DataType::UInt64,
            Value::Int64(_) => DataType::Int64,
            Value::Float64(_) => DataType::Float64,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::UInt64(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::String(_) => 4,
            Value::Binary(_) => 5,
        }
    }
}

/// Total order used to sort and deduplicate requested keys. Floats compare by
/// their IEEE total order so that equal keys always encode identically.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered columns of a table plus the position of its single primary-key
/// column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
    primary_key: usize,
}

impl Schema {
    /// Builds a schema keyed by `primary_key`.
    ///
    /// Exactly one primary-key column is supported; passing several names is
    /// rejected, as is a name that is not a column.
    pub fn new(columns: Vec<Column>, primary_key: &[&str]) -> Result<Self> {
        let [key] = primary_key else {
            return Err(Error::BadArguments(
                "KeeperMap requires one column in primary key".to_string(),
            ));
        };
        let position = columns.iter().position(|c| c.name == *key).ok_or_else(|| {
            Error::BadArguments(format!("primary key column '{}' is not a column", key))
        })?;
        Ok(Self {
            columns,
            primary_key: position,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key_position(&self) -> usize {
        self.primary_key
    }

    pub fn primary_key(&self) -> &Column {
        &self.columns[self.primary_key]
    }

    /// Returns a row made of every column's default value.
    pub fn default_row(&self) -> Row {
        self.columns
            .iter()
            .map(|c| c.data_type.default_value())
            .collect()
    }

    /// Checks that `row` has one value per column with matching types.
    pub fn validate_row(&self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Encoding(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if value.data_type() != column.data_type {
                return Err(Error::Encoding(format!(
                    "column '{}' expects {:?}, got {:?}",
                    column.name,
                    column.data_type,
                    value.data_type()
                )));
            }
        }
        Ok(())
    }
}

/// A row: one value per schema column, in schema order.
pub type Row = Vec<Value>;

/// A batch of rows produced by one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    /// Present when null reporting was requested: `null_map[i]` is true when
    /// the i-th requested key was not found and `rows[i]` holds defaults.
    pub null_map: Option<Vec<bool>>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
