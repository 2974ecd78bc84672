//! Error types for the conformance engine
//!
//! Catalog-authoring errors abort a run before any request is sent; device
//! misbehavior is reported through verdicts instead and never surfaces here.

use std::io;
use thiserror::Error;

use crate::catalog::TestId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the conformance engine
#[derive(Error, Debug)]
pub enum Error {
    // === Catalog Errors ===
    #[error("dependency cycle in test catalog: {0}")]
    DependencyCycle(String),

    #[error("duplicate test id '{0}' in catalog")]
    DuplicateTestId(TestId),

    #[error("property '{property}' is provided by both '{first}' and '{second}'")]
    AmbiguousProducer {
        property: String,
        first: TestId,
        second: TestId,
    },

    #[error("test '{test}' depends on unknown test '{dependency}'")]
    UnknownDependency { test: TestId, dependency: TestId },

    // === Property Store Errors ===
    #[error("property '{property}' was produced by '{producer}', refusing write from '{writer}'")]
    ProducerMismatch {
        property: String,
        producer: TestId,
        writer: TestId,
    },

    #[error("property '{0}' has no value")]
    PropertyNotFound(String),

    #[error("property '{property}' is not {expected}")]
    PropertyType {
        property: String,
        expected: &'static str,
    },

    // === Behavior Errors ===
    #[error("behavior error in test '{test}': {message}")]
    Behavior { test: TestId, message: String },

    // === Transport Errors ===
    #[error("transport error: {0}")]
    Transport(String),

    // === Configuration Errors ===
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Internal Errors ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a dependency cycle error naming the cycle members in order
    pub fn dependency_cycle(cycle: &[TestId]) -> Self {
        let names: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
        Self::DependencyCycle(names.join(" -> "))
    }

    /// Create a behavior error for a specific test
    pub fn behavior(test: &TestId, message: impl Into<String>) -> Self {
        Self::Behavior {
            test: test.clone(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
