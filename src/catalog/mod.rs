//! Static test catalog
//!
//! Descriptors are the fixed input of a run: identity, category, target
//! parameter, the provides/requires contract, hard predecessors, and the
//! behavior strategy. The engine never constructs them itself; a catalog
//! loader supplies the full set up front.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::behavior::TestBehavior;
use crate::protocol::ParameterId;

/// Identity of a test case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TestId(String);

impl TestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Reporting/filtering category of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TestCategory {
    Core,
    ErrorConditions,
    ProductInformation,
    DmxSetup,
    SubDevices,
    Control,
    StatusCollection,
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Core => "Core Functionality",
            Self::ErrorConditions => "Error Conditions",
            Self::ProductInformation => "Product Information",
            Self::DmxSetup => "DMX Setup",
            Self::SubDevices => "Sub Devices",
            Self::Control => "Control",
            Self::StatusCollection => "Status Collection",
        };
        write!(f, "{}", name)
    }
}

/// Static description of one test case
#[derive(Clone)]
pub struct TestDescriptor {
    pub id: TestId,
    pub category: TestCategory,
    /// The protocol parameter this test exercises
    pub parameter: ParameterId,
    /// Property names this test may publish
    pub provides: Vec<String>,
    /// Property names this test reads; each must have exactly one enabled
    /// producer in the catalog or the test is not runnable
    pub requires: Vec<String>,
    /// Tests that must run first even without a property link; if any of
    /// them is skipped, this test is skipped too
    pub hard_dependencies: Vec<TestId>,
    pub behavior: Arc<dyn TestBehavior>,
}

impl TestDescriptor {
    pub fn new(
        id: impl Into<TestId>,
        category: TestCategory,
        parameter: ParameterId,
        behavior: Arc<dyn TestBehavior>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            parameter,
            provides: Vec::new(),
            requires: Vec::new(),
            hard_dependencies: Vec::new(),
            behavior,
        }
    }

    pub fn provides(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.provides.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn requires(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn hard_dependencies(
        mut self,
        ids: impl IntoIterator<Item = impl Into<TestId>>,
    ) -> Self {
        self.hard_dependencies
            .extend(ids.into_iter().map(Into::into));
        self
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("parameter", &self.parameter)
            .field("provides", &self.provides)
            .field("requires", &self.requires)
            .field("hard_dependencies", &self.hard_dependencies)
            .finish_non_exhaustive()
    }
}

/// The full set of test cases for a run, in declaration order
///
/// Declaration order is significant: the scheduler breaks topological ties
/// with it so repeated runs are diffable.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    tests: Vec<TestDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: TestDescriptor) {
        self.tests.push(descriptor);
    }

    pub fn with(mut self, descriptor: TestDescriptor) -> Self {
        self.push(descriptor);
        self
    }

    pub fn tests(&self) -> &[TestDescriptor] {
        &self.tests
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Descriptor at a declaration-order index, `None` when out of range
    pub fn get(&self, index: usize) -> Option<&TestDescriptor> {
        self.tests.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::GetAndCapture;

    #[test]
    fn get_is_total_over_any_index() {
        let catalog = Catalog::new().with(TestDescriptor::new(
            "GetDeviceInfo",
            TestCategory::Core,
            ParameterId(0x0060),
            Arc::new(GetAndCapture::new()),
        ));
        assert_eq!(catalog.get(0).map(|t| t.id.as_str()), Some("GetDeviceInfo"));
        assert!(catalog.get(1).is_none());
    }
}
