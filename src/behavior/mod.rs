//! Test behaviors and the context they drive
//!
//! A behavior is the dynamic half of a test case: it composes the request,
//! declares the acceptable outcomes, and applies side effects once the
//! response is classified. Shared patterns from the catalog (unsupported
//! SETs always nack, GETs with stray data, set-then-read-back) are provided
//! here as reusable strategies selected by configuration, instead of an
//! inheritance chain.

use crate::catalog::TestId;
use crate::common::{Error, Result};
use crate::matcher::ExpectedResult;
use crate::property::{PropertyStore, PropertyValue};
use crate::protocol::{
    ExchangeOutcome, FieldMap, FieldValue, NackReason, ParameterId, Request, ResponseBody,
    ALL_SUB_DEVICES,
};

/// The classified response handed to continuations and `verify`
#[derive(Debug, Clone)]
pub struct MatchedResponse {
    /// False when the matched entry accepted silence
    pub responded: bool,
    /// Present when the response was a rejection
    pub nack_reason: Option<NackReason>,
    /// Decoded fields of an acknowledgement; empty otherwise
    pub fields: FieldMap,
}

impl MatchedResponse {
    pub(crate) fn from_outcome(outcome: &ExchangeOutcome) -> Self {
        match outcome {
            ExchangeOutcome::NoResponse => Self {
                responded: false,
                nack_reason: None,
                fields: FieldMap::new(),
            },
            ExchangeOutcome::Response(response) => match &response.body {
                ResponseBody::Ack { fields } => Self {
                    responded: true,
                    nack_reason: None,
                    fields: fields.clone(),
                },
                ResponseBody::Nack { reason } => Self {
                    responded: true,
                    nack_reason: Some(*reason),
                    fields: FieldMap::new(),
                },
            },
        }
    }

    /// Whether the matched response was a successful acknowledgement
    pub fn was_ack(&self) -> bool {
        self.responded && self.nack_reason.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn integer_field(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }
}

/// A verdict a behavior reaches without (further) exchanges
#[derive(Debug, Clone)]
pub enum EarlyVerdict {
    /// Precondition makes the test meaningless (zero sub-devices, exhausted
    /// address space); the test is skipped, not failed
    NotRun(String),
    /// Hard failure decided by test logic
    Failed(String),
    /// The device violated the protocol itself
    Broken(String),
}

/// Handle a behavior uses to talk to the engine
///
/// At most one request may be queued per state-machine step; the run
/// coordinator sends it and resumes the behavior with the classified
/// response.
pub struct TestContext<'a> {
    test_id: TestId,
    parameter: ParameterId,
    sub_device: u16,
    store: &'a mut PropertyStore,
    outgoing: Option<(Request, Vec<ExpectedResult>)>,
    warnings: Vec<String>,
    advisories: Vec<String>,
    early: Option<EarlyVerdict>,
}

impl<'a> TestContext<'a> {
    pub(crate) fn new(
        test_id: TestId,
        parameter: ParameterId,
        sub_device: u16,
        store: &'a mut PropertyStore,
    ) -> Self {
        Self {
            test_id,
            parameter,
            sub_device,
            store,
            outgoing: None,
            warnings: Vec::new(),
            advisories: Vec::new(),
            early: None,
        }
    }

    pub fn test_id(&self) -> &TestId {
        &self.test_id
    }

    /// The parameter this test targets
    pub fn parameter(&self) -> ParameterId {
        self.parameter
    }

    /// The sub-device this run is addressed to
    pub fn sub_device(&self) -> u16 {
        self.sub_device
    }

    // === Requests ===

    /// Queue a request with its ordered expected-result list
    pub fn send(&mut self, request: Request, expected: Vec<ExpectedResult>) -> Result<()> {
        if self.outgoing.is_some() {
            return Err(Error::behavior(
                &self.test_id,
                "a request is already queued; only one may be outstanding",
            ));
        }
        self.outgoing = Some((request, expected));
        Ok(())
    }

    /// GET the target parameter on the run's sub-device
    pub fn send_get(&mut self, expected: Vec<ExpectedResult>) -> Result<()> {
        self.send(Request::get(self.parameter, self.sub_device), expected)
    }

    /// GET with an explicit payload (e.g. an index, or junk data)
    pub fn send_get_with_payload(
        &mut self,
        payload: impl Into<Vec<u8>>,
        expected: Vec<ExpectedResult>,
    ) -> Result<()> {
        self.send(
            Request::get(self.parameter, self.sub_device).with_payload(payload),
            expected,
        )
    }

    /// GET addressed to a different sub-device than the run target
    pub fn send_get_to(
        &mut self,
        sub_device: u16,
        expected: Vec<ExpectedResult>,
    ) -> Result<()> {
        self.send(Request::get(self.parameter, sub_device), expected)
    }

    /// SET the target parameter on the run's sub-device
    pub fn send_set(
        &mut self,
        payload: impl Into<Vec<u8>>,
        expected: Vec<ExpectedResult>,
    ) -> Result<()> {
        self.send(
            Request::set(self.parameter, self.sub_device).with_payload(payload),
            expected,
        )
    }

    // === Properties ===

    pub fn get_property(&self, name: &str) -> Result<&PropertyValue> {
        self.store.get(name)
    }

    pub fn get_integer_property(&self, name: &str) -> Result<i64> {
        self.store.get_integer(name)
    }

    /// Publish a fact under this test's identity
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.store.set(name, value, &self.test_id)
    }

    /// Mark a fact as explicitly unknown
    pub fn clear_property(&mut self, name: &str) {
        self.store.clear(name);
    }

    // === Report annotations ===

    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(test = %self.test_id, "{}", message);
        self.warnings.push(message);
    }

    pub fn add_advisory(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(test = %self.test_id, advisory = true, "{}", message);
        self.advisories.push(message);
    }

    // === Early termination ===

    /// Skip the test: a precondition makes it meaningless
    pub fn set_not_run(&mut self, reason: impl Into<String>) {
        self.early = Some(EarlyVerdict::NotRun(reason.into()));
    }

    /// Fail the test from within test logic
    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.early = Some(EarlyVerdict::Failed(reason.into()));
    }

    /// Mark the device as violating the protocol
    pub fn set_broken(&mut self, reason: impl Into<String>) {
        self.early = Some(EarlyVerdict::Broken(reason.into()));
    }

    // === Coordinator access ===

    pub(crate) fn take_outgoing(&mut self) -> Option<(Request, Vec<ExpectedResult>)> {
        self.outgoing.take()
    }

    pub(crate) fn take_early(&mut self) -> Option<EarlyVerdict> {
        self.early.take()
    }

    pub(crate) fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn advisories(&self) -> &[String] {
        &self.advisories
    }
}

/// Dynamic behavior of a test case
///
/// `initiate` runs once when the test's turn arrives and must either queue
/// exactly one request or set an early verdict. `verify` runs after the
/// final response of the chain matched an entry with no continuation.
pub trait TestBehavior: Send + Sync {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()>;

    fn verify(&self, _ctx: &mut TestContext<'_>, _response: &MatchedResponse) -> Result<()> {
        Ok(())
    }
}

/// Convert a decoded response field into a storable property value
fn property_from_field(value: &FieldValue) -> PropertyValue {
    match value {
        FieldValue::Integer(v) => PropertyValue::Integer(*v),
        FieldValue::Text(v) => PropertyValue::Text(v.clone()),
        FieldValue::Bytes(v) => {
            PropertyValue::List(v.iter().map(|b| PropertyValue::Integer(*b as i64)).collect())
        }
        FieldValue::List(v) => PropertyValue::List(v.iter().map(property_from_field).collect()),
    }
}

// === Reusable strategies ===

/// GET a parameter, require an ack, and publish captured fields as
/// properties
///
/// With `allow_nack`, listed rejections are acceptable too; a matched nack
/// clears the captured properties so dependents see an explicit unknown.
#[derive(Default)]
pub struct GetAndCapture {
    required: Vec<String>,
    values: FieldMap,
    captures: Vec<(String, String)>,
    nack_ok: Vec<NackReason>,
}

impl GetAndCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a field to be present in the ack
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Require a field to equal a fixed value
    pub fn expect_value(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Publish a response field under a property name
    pub fn capture(mut self, field: impl Into<String>, property: impl Into<String>) -> Self {
        self.captures.push((field.into(), property.into()));
        self
    }

    /// Also accept a rejection with this reason
    pub fn allow_nack(mut self, reason: NackReason) -> Self {
        self.nack_ok.push(reason);
        self
    }
}

impl TestBehavior for GetAndCapture {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let mut expected = Vec::new();
        if !self.nack_ok.is_empty() {
            expected.push(ExpectedResult::nack_any(self.nack_ok.iter().copied()));
        }
        // captured fields are implicitly required
        let required = self
            .required
            .iter()
            .cloned()
            .chain(self.captures.iter().map(|(field, _)| field.clone()));
        expected.push(
            ExpectedResult::ack_with_values(self.values.clone()).require_fields(required),
        );
        ctx.send_get(expected)
    }

    fn verify(&self, ctx: &mut TestContext<'_>, response: &MatchedResponse) -> Result<()> {
        if response.was_ack() {
            for (field, property) in &self.captures {
                if let Some(value) = response.field(field) {
                    ctx.set_property(property.clone(), property_from_field(value))?;
                }
            }
        } else {
            for (_, property) in &self.captures {
                ctx.clear_property(property);
            }
        }
        Ok(())
    }
}

/// GET with a junk payload: a compliant responder nacks with
/// NR_FORMAT_ERROR, but an ack is tolerated with a warning
pub struct GetWithJunkData {
    payload: Vec<u8>,
}

impl GetWithJunkData {
    pub fn new() -> Self {
        Self {
            payload: b"foo".to_vec(),
        }
    }
}

impl Default for GetWithJunkData {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBehavior for GetWithJunkData {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let parameter = ctx.parameter();
        let expected = vec![
            ExpectedResult::nack(NackReason::FormatError),
            ExpectedResult::ack()
                .with_warning(format!("GET {} with data returned an ack", parameter)),
        ];
        ctx.send_get_with_payload(self.payload.clone(), expected)
    }
}

/// SET a parameter that does not support SET: the responder must reject it
///
/// Either NR_UNSUPPORTED_COMMAND_CLASS or NR_UNKNOWN_PID is a valid
/// rejection for a read-only parameter.
#[derive(Default)]
pub struct UnsupportedSet;

impl TestBehavior for UnsupportedSet {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let expected = vec![ExpectedResult::nack_any([
            NackReason::UnsupportedCommandClass,
            NackReason::UnknownPid,
        ])];
        ctx.send_set(Vec::new(), expected)
    }
}

/// SET a value, then GET it back and check the device really applied it
///
/// The canonical two-round-trip chain: the ack of the SET triggers the
/// verification GET as a continuation.
pub struct SetThenVerify {
    set_payload: Vec<u8>,
    verify_field: String,
    verify_value: FieldValue,
}

impl SetThenVerify {
    pub fn new(
        set_payload: impl Into<Vec<u8>>,
        verify_field: impl Into<String>,
        verify_value: impl Into<FieldValue>,
    ) -> Self {
        Self {
            set_payload: set_payload.into(),
            verify_field: verify_field.into(),
            verify_value: verify_value.into(),
        }
    }
}

impl TestBehavior for SetThenVerify {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let field = self.verify_field.clone();
        let value = self.verify_value.clone();
        let expected = vec![ExpectedResult::ack().then(move |ctx, _response| {
            ctx.send_get(vec![ExpectedResult::ack_with_values([(field, value)])])
        })];
        ctx.send_set(self.set_payload.clone(), expected)
    }
}

/// GET addressed to the all-sub-devices wildcard must be rejected
///
/// GETs cannot be broadcast to every sub-device; the required rejection is
/// NR_SUB_DEVICE_OUT_OF_RANGE.
#[derive(Default)]
pub struct AllSubDevicesGet;

impl TestBehavior for AllSubDevicesGet {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let expected = vec![ExpectedResult::nack(NackReason::SubDeviceOutOfRange)];
        ctx.send_get_to(ALL_SUB_DEVICES, expected)
    }
}
