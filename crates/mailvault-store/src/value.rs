//! Owned values and rows.
//!
//! Result rows are materialized into [`Row`]s at the backend boundary so
//! that decoders and tests never touch driver types directly.

/// An owned SQL value, used both for binding parameters and for reading
/// result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Any SQLite integer.
    Int(i64),
    /// A float.
    Real(f64),
    /// Text.
    Text(String),
    /// A blob.
    Blob(Vec<u8>),
    /// A boolean, bound as an integer.
    Bool(bool),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// One result row, indexed by column name.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Builds a row from named values.
    #[must_use]
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    /// The raw value of a column, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// An integer column. `None` for NULL, absent or non-integer columns.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// A text column.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(v)) => Some(v),
            _ => None,
        }
    }

    /// A blob column.
    #[must_use]
    pub fn blob(&self, name: &str) -> Option<&[u8]> {
        match self.get(name) {
            Some(Value::Blob(v)) => Some(v),
            _ => None,
        }
    }

    /// A boolean column, accepting SQLite's integer encoding.
    #[must_use]
    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(v)) => Some(*v),
            Some(Value::Int(v)) => Some(*v != 0),
            _ => None,
        }
    }

    /// True if the column is present and NULL.
    #[must_use]
    pub fn is_null(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Null))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let row = Row::new(vec![
            ("uid".into(), Value::Int(17)),
            ("name".into(), Value::Text("\\Seen".into())),
            ("seen".into(), Value::Int(1)),
            ("data".into(), Value::Null),
        ]);

        assert_eq!(row.int("uid"), Some(17));
        assert_eq!(row.text("name"), Some("\\Seen"));
        assert_eq!(row.boolean("seen"), Some(true));
        assert!(row.is_null("data"));
        assert_eq!(row.int("missing"), None);
        assert_eq!(row.text("uid"), None);
    }
}
