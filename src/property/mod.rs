//! Per-run property blackboard
//!
//! Tests publish facts they discover (footprint, personality count, the
//! supported parameter set) and later tests consume them. The store is
//! scoped to one run against one target and is only ever touched by the
//! single in-flight test, so it needs no locking.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use crate::catalog::TestId;
use crate::common::{Error, Result};

/// A typed fact discovered during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Text(String),
    Bool(bool),
    List(Vec<PropertyValue>),
    /// A set of numeric parameter ids, e.g. the supported-parameters list
    IdSet(BTreeSet<u16>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{:?}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::List(v) => write!(f, "[{} items]", v.len()),
            Self::IdSet(v) => write!(f, "{{{} ids}}", v.len()),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: PropertyValue,
    producer: TestId,
}

/// Key/value store of facts produced and consumed by tests
///
/// Write-once per run: only the original producer may refresh a value.
/// The scheduler guarantees readers run after their producer completed.
#[derive(Debug, Default)]
pub struct PropertyStore {
    entries: HashMap<String, Entry>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fact under `name`
    ///
    /// Fails with [`Error::ProducerMismatch`] if a different test already
    /// produced this name during the run. The same producer may overwrite
    /// its own value (re-querying a changing counter).
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
        producer: &TestId,
    ) -> Result<()> {
        let name = name.into();
        if let Some(existing) = self.entries.get(&name) {
            if existing.producer != *producer {
                return Err(Error::ProducerMismatch {
                    property: name,
                    producer: existing.producer.clone(),
                    writer: producer.clone(),
                });
            }
        }
        self.entries.insert(
            name,
            Entry {
                value: value.into(),
                producer: producer.clone(),
            },
        );
        Ok(())
    }

    /// Look up a fact by name
    pub fn get(&self, name: &str) -> Result<&PropertyValue> {
        self.entries
            .get(name)
            .map(|e| &e.value)
            .ok_or_else(|| Error::PropertyNotFound(name.to_string()))
    }

    /// Look up an integer fact, failing if it holds a different type
    pub fn get_integer(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            PropertyValue::Integer(v) => Ok(*v),
            _ => Err(Error::PropertyType {
                property: name.to_string(),
                expected: "an integer",
            }),
        }
    }

    /// Look up a text fact, failing if it holds a different type
    pub fn get_text(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            PropertyValue::Text(v) => Ok(v.as_str()),
            _ => Err(Error::PropertyType {
                property: name.to_string(),
                expected: "text",
            }),
        }
    }

    /// Remove a fact
    ///
    /// Used when a test could not determine the value (e.g. after a failed
    /// GET) so dependents see an explicit "unknown" rather than stale data.
    pub fn clear(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Whether a fact is currently recorded
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
