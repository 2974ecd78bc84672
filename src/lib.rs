//! Conformance test engine for RDM responders
//!
//! Drives a battery of protocol exchanges against one responding device
//! (and its sub-devices), classifies every response against declared
//! acceptable outcomes, and aggregates pass/fail/advisory results. The
//! test catalog, the parameter registry and the transport are supplied by
//! the embedding tool; this crate owns the dependency-aware scheduler, the
//! per-test request/response state machine and the expected-result matcher.

pub mod behavior;
pub mod catalog;
pub mod common;
pub mod matcher;
pub mod property;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod schedule;

// Re-export commonly used types
pub use behavior::{MatchedResponse, TestBehavior, TestContext};
pub use catalog::{Catalog, TestCategory, TestDescriptor, TestId};
pub use common::{EngineConfig, Error, Result};
pub use matcher::{ExpectedResult, Severity};
pub use property::{PropertyStore, PropertyValue};
pub use protocol::{
    CommandClass, DeviceResponse, FieldValue, NackReason, ParameterId, ParameterRegistry,
    Request, Target, Transport,
};
pub use report::{ProgressEvent, RunReport, Summary, TestReport, Verdict};
pub use runner::{CancelToken, RunCoordinator};
pub use schedule::{plan, Schedule, SkipReason};
