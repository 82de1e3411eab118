#![forbid(unsafe_code)]

use serde::Serialize;
use std::fmt;

/// One physical record of the input series: column name to raw text, in header order.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Row {
    line: u64,
    columns: Vec<(String, String)>,
}

impl Row {
    pub fn new(line: u64, columns: Vec<(String, String)>) -> Self {
        Self { line, columns }
    }

    pub fn from_pairs<I, K, V>(line: u64, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            line,
            columns: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Physical line the row starts on (1-based, the header is line 1).
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(|(_, value)| value.as_str())
    }

    /// Iterates `(position, name, value)` in header order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, &str)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(index, (name, value))| (index, name.as_str(), value.as_str()))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Stable name of the logical device a column is published under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
