use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Engine-level column type, derived from the declared type with SQLite affinity rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StorageType {
    Integer,
    Real,
    Numeric,
    Text,
    Blob,
    Boolean,
    /// No declared type; the column accepts any value.
    Any,
}

impl StorageType {
    /// Maps a declared column type (`VARCHAR(32)`, `BIGINT`, `BOOLEAN`...) to a storage type.
    pub fn from_declared(declared: &str) -> StorageType {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return StorageType::Any;
        }
        if upper.contains("BOOL") {
            return StorageType::Boolean;
        }
        if upper.contains("INT") {
            return StorageType::Integer;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            return StorageType::Text;
        }
        if upper.contains("BLOB") {
            return StorageType::Blob;
        }
        if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            return StorageType::Real;
        }
        StorageType::Numeric
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            StorageType::Integer | StorageType::Real | StorageType::Numeric | StorageType::Boolean
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Integer => "integer",
            StorageType::Real => "real",
            StorageType::Numeric => "numeric",
            StorageType::Text => "text",
            StorageType::Blob => "blob",
            StorageType::Boolean => "boolean",
            StorageType::Any => "any",
        }
    }
}

/// How a runtime value relates to a column's storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFit {
    Exact,
    /// Accepted by widening (integer into real, boolean into integer...).
    Widened,
    /// Accepted by the store, but stored with a different representation.
    Coerced,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(CompactString),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Real(_) => 3,
            Value::Text(_) => 4,
            Value::Blob(_) => 5,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Boolean(_) => "boolean",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn text(value: impl Into<CompactString>) -> Value {
        Value::Text(value.into())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Checks the value against a storage type. Nullability is checked separately.
    pub fn fit(&self, ty: StorageType) -> TypeFit {
        match (self, ty) {
            (Value::Null, _) | (_, StorageType::Any) => TypeFit::Exact,
            (Value::Integer(_), StorageType::Integer)
            | (Value::Real(_), StorageType::Real)
            | (Value::Text(_), StorageType::Text)
            | (Value::Blob(_), StorageType::Blob)
            | (Value::Boolean(_), StorageType::Boolean) => TypeFit::Exact,
            (Value::Integer(_) | Value::Real(_), StorageType::Numeric) => TypeFit::Exact,
            (Value::Integer(_), StorageType::Real)
            | (Value::Boolean(_), StorageType::Integer | StorageType::Real | StorageType::Numeric) => {
                TypeFit::Widened
            }
            (Value::Integer(v), StorageType::Boolean) if *v == 0 || *v == 1 => TypeFit::Widened,
            (Value::Integer(_) | Value::Real(_) | Value::Boolean(_), StorageType::Text) => {
                TypeFit::Coerced
            }
            (Value::Text(_), StorageType::Blob) => TypeFit::Coerced,
            _ => TypeFit::Rejected,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

pub type Row = Vec<Value>;
