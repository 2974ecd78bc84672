//! Expected-result patterns and the response classifier
//!
//! Each outstanding request carries an ordered list of [`ExpectedResult`]s;
//! the first entry whose pattern matches the received response wins. The
//! precedence inside a pattern is deliberate: response kind first, then the
//! rejection reason, then individual ack fields. A wrong kind of response
//! is always worse than a recognized-but-noteworthy acknowledgement.

use std::fmt;

use serde::Serialize;

use crate::behavior::{MatchedResponse, TestContext};
use crate::common::Result;
use crate::protocol::{
    DeviceResponse, ExchangeOutcome, FieldMap, FieldValue, NackReason, ResponseBody,
};

/// Non-fatal annotation attached to a matched entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// Borderline-compliant behavior worth a human look
    Warning,
    /// Standard leaves the behavior open; even softer than a warning
    Advisory,
}

/// Callback run when its entry matched, to chain the next request
pub type Continuation =
    Box<dyn FnOnce(&mut TestContext<'_>, &MatchedResponse) -> Result<()> + Send>;

/// The shape of response an entry accepts
pub enum ResponsePattern {
    /// Acknowledged; `required` fields must be present, `values` fields must
    /// be present and equal. Unmentioned fields are captured, not checked.
    Ack { required: Vec<String>, values: FieldMap },
    /// Rejected with any of the listed reasons. Several reasons are allowed
    /// because compliant devices may choose among equally valid rejections.
    Nack { reasons: Vec<NackReason> },
    /// No response before the deadline. Rare; used for commands that
    /// intentionally provoke a reset.
    NoResponse,
}

impl fmt::Debug for ResponsePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack { required, values } => f
                .debug_struct("Ack")
                .field("required", required)
                .field("values", values)
                .finish(),
            Self::Nack { reasons } => f.debug_struct("Nack").field("reasons", reasons).finish(),
            Self::NoResponse => write!(f, "NoResponse"),
        }
    }
}

/// One acceptable outcome for an outstanding request
pub struct ExpectedResult {
    pattern: ResponsePattern,
    severity: Option<(Severity, String)>,
    continuation: Option<Continuation>,
}

impl ExpectedResult {
    /// Accept any successful acknowledgement
    pub fn ack() -> Self {
        Self {
            pattern: ResponsePattern::Ack {
                required: Vec::new(),
                values: FieldMap::new(),
            },
            severity: None,
            continuation: None,
        }
    }

    /// Accept an acknowledgement that carries all the named fields
    pub fn ack_with_required(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            pattern: ResponsePattern::Ack {
                required: fields.into_iter().map(Into::into).collect(),
                values: FieldMap::new(),
            },
            severity: None,
            continuation: None,
        }
    }

    /// Accept an acknowledgement whose named fields equal the given values
    pub fn ack_with_values(
        values: impl IntoIterator<Item = (impl Into<String>, impl Into<FieldValue>)>,
    ) -> Self {
        Self {
            pattern: ResponsePattern::Ack {
                required: Vec::new(),
                values: values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            },
            severity: None,
            continuation: None,
        }
    }

    /// Accept a rejection with exactly this reason
    pub fn nack(reason: NackReason) -> Self {
        Self {
            pattern: ResponsePattern::Nack {
                reasons: vec![reason],
            },
            severity: None,
            continuation: None,
        }
    }

    /// Accept a rejection with any of the listed reasons
    pub fn nack_any(reasons: impl IntoIterator<Item = NackReason>) -> Self {
        Self {
            pattern: ResponsePattern::Nack {
                reasons: reasons.into_iter().collect(),
            },
            severity: None,
            continuation: None,
        }
    }

    /// Accept silence: the request intentionally provokes no reply
    pub fn no_response() -> Self {
        Self {
            pattern: ResponsePattern::NoResponse,
            severity: None,
            continuation: None,
        }
    }

    /// Add required fields to an ack pattern (no-op on nack patterns)
    pub fn require_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let ResponsePattern::Ack { required, .. } = &mut self.pattern {
            required.extend(fields.into_iter().map(Into::into));
        }
        self
    }

    /// Tag a match of this entry with a warning message
    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.severity = Some((Severity::Warning, message.into()));
        self
    }

    /// Tag a match of this entry with an advisory message
    pub fn with_advisory(mut self, message: impl Into<String>) -> Self {
        self.severity = Some((Severity::Advisory, message.into()));
        self
    }

    /// Chain another request when this entry matches
    pub fn then(
        mut self,
        continuation: impl FnOnce(&mut TestContext<'_>, &MatchedResponse) -> Result<()>
            + Send
            + 'static,
    ) -> Self {
        self.continuation = Some(Box::new(continuation));
        self
    }

    pub fn severity(&self) -> Option<(Severity, &str)> {
        self.severity.as_ref().map(|(s, m)| (*s, m.as_str()))
    }

    pub fn into_continuation(self) -> Option<Continuation> {
        self.continuation
    }

    fn matches(&self, outcome: &ExchangeOutcome) -> bool {
        match (&self.pattern, outcome) {
            (ResponsePattern::NoResponse, ExchangeOutcome::NoResponse) => true,
            (ResponsePattern::Nack { reasons }, ExchangeOutcome::Response(response)) => {
                match &response.body {
                    ResponseBody::Nack { reason } => reasons.contains(reason),
                    ResponseBody::Ack { .. } => false,
                }
            }
            (ResponsePattern::Ack { required, values }, ExchangeOutcome::Response(response)) => {
                match &response.body {
                    ResponseBody::Ack { fields } => {
                        required.iter().all(|name| fields.contains_key(name))
                            && values
                                .iter()
                                .all(|(name, value)| fields.get(name) == Some(value))
                    }
                    ResponseBody::Nack { .. } => false,
                }
            }
            _ => false,
        }
    }
}

/// Outcome of classifying a response against an expected-result list
#[derive(Debug)]
pub enum Classification {
    /// Index of the first matching entry
    Matched(usize),
    /// Nothing matched; the description names the actual response
    Unmatched { description: String },
}

/// Scan the list in order and return the first match
///
/// No match is an expected-mismatch failure for the caller, never a crash.
pub fn classify(expected: &[ExpectedResult], outcome: &ExchangeOutcome) -> Classification {
    for (index, entry) in expected.iter().enumerate() {
        if entry.matches(outcome) {
            return Classification::Matched(index);
        }
    }
    Classification::Unmatched {
        description: describe_outcome(outcome),
    }
}

/// Render the actual response for a mismatch message
pub fn describe_outcome(outcome: &ExchangeOutcome) -> String {
    match outcome {
        ExchangeOutcome::NoResponse => "no response before the deadline".to_string(),
        ExchangeOutcome::Response(DeviceResponse { parameter, body }) => match body {
            ResponseBody::Nack { reason } => {
                format!("NACK for {} with {}", parameter, reason)
            }
            ResponseBody::Ack { fields } => {
                let listed: Vec<String> = fields
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                format!("ACK for {} with fields {{{}}}", parameter, listed.join(", "))
            }
        },
    }
}
