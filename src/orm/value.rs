//! Values that travel between entities, parameters and database rows.

use serde_json::{Number, Value as JsonValue};

/// Represents a SQL value that can be bound to a query or read from a row.
///
/// `List` only exists on the parameter side: it is expanded by `:...name`
/// placeholders and never bound directly.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
    List(Vec<SqlValue>),
}

impl SqlValue {
    /// Bind this value to a sqlx query builder
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
            SqlValue::Bytes(b) => query.bind(b.as_slice()),
            // Lists are expanded by the compiler; binding one is a NULL.
            SqlValue::Null | SqlValue::List(_) => query.bind(None::<String>),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Bool(b) => Some(*b as i64),
            SqlValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual key used when grouping rows by primary key.
    pub(crate) fn key_fragment(&self) -> String {
        match self {
            SqlValue::String(s) => format!("s:{}", s),
            SqlValue::Int(i) => format!("i:{}", i),
            // Integral floats group with integers (e.g. REAL ids from expressions)
            SqlValue::Float(f) if f.fract() == 0.0 => format!("i:{}", *f as i64),
            SqlValue::Float(f) => format!("f:{}", f),
            SqlValue::Bool(b) => format!("i:{}", *b as i64),
            SqlValue::Bytes(b) => format!("b:{:?}", b),
            SqlValue::Null => "null".to_string(),
            SqlValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.key_fragment()).collect();
                format!("l:[{}]", parts.join(","))
            }
        }
    }

    /// Convert to the JSON representation used for entity fields.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::String(s) => JsonValue::String(s.clone()),
            SqlValue::Int(i) => JsonValue::Number((*i).into()),
            SqlValue::Float(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SqlValue::Bool(b) => JsonValue::Bool(*b),
            SqlValue::Bytes(b) => JsonValue::Array(b.iter().map(|x| JsonValue::from(*x)).collect()),
            SqlValue::Null => JsonValue::Null,
            SqlValue::List(items) => JsonValue::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Convert a JSON entity field into a bindable value.
    ///
    /// Objects are stored as their JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => SqlValue::String(s.clone()),
            JsonValue::Array(items) => SqlValue::List(items.iter().map(SqlValue::from_json).collect()),
            JsonValue::Object(_) => SqlValue::String(value.to_string()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(values: Vec<T>) -> Self {
        SqlValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Build a parameter list for [QueryBuilder::set_parameters](crate::orm::QueryBuilder::set_parameters)
/// and friends.
///
/// ```rust,ignore
/// qb.and_where("post.title = :title", params! { "title" => "p1" })
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<(::std::string::String, $crate::orm::SqlValue)>::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        vec![$((::std::string::String::from($name), $crate::orm::SqlValue::from($value))),+]
    };
}
