//! Boundary to the external SQL engine.
//!
//! The engine is a black box: it takes SQL text and answers with column names
//! and rows. MVT-producing statements return one binary column per tile.

pub use futures_util::future::BoxFuture;
use thiserror::Error;

/// One SQL connection.
///
/// Implementations must be `Send + Sync`; the pipeline serialises calls, so an
/// implementation never sees two statements at once.
pub trait QueryEngine: Send + Sync {
    fn execute(&self, sql: &str) -> BoxFuture<'_, Result<QueryResult, QueryError>>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// The engine rejected the statement.
    #[error("query rejected: {0}")]
    Sql(String),
    /// The engine is down or crashed.
    #[error("query engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First cell of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercions() {
        assert_eq!(Value::Int(4).as_f64(), Some(4.0));
        assert_eq!(Value::Float(7.0).as_i64(), Some(7));
        assert_eq!(Value::Float(7.5).as_i64(), None);
        assert_eq!(Value::Text(" 12 ".into()).as_i64(), Some(12));
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn column_lookup_ignores_case() {
        let result = QueryResult::new(
            vec!["xtile".into(), "YTILE".into(), "mvt".into()],
            vec![vec![Value::Int(1), Value::Int(2), Value::Blob(vec![1])]],
        );
        assert_eq!(result.column("ytile"), Some(1));
        assert_eq!(result.column("missing"), None);
        assert_eq!(result.scalar(), Some(&Value::Int(1)));
    }
}
