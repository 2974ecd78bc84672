//! Structured view of the device-management protocol
//!
//! The engine never touches wire bytes. Requests carry an opaque payload
//! assembled by test behaviors; responses arrive pre-decoded as a
//! (kind, reason, field-map) view supplied by the transport layer.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::common::Result;

/// The root device, sub-device address 0
pub const ROOT_DEVICE: u16 = 0;

/// Wildcard sub-device address reaching every sub-device at once
pub const ALL_SUB_DEVICES: u16 = 0xffff;

/// The device (or addressed sub-device) under test for one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    /// Unique identifier of the responder, e.g. "7a70:00000001"
    pub uid: String,
    /// Sub-device the run is addressed to; [`ROOT_DEVICE`] for the root
    pub sub_device: u16,
}

impl Target {
    pub fn root(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            sub_device: ROOT_DEVICE,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.sub_device)
    }
}

/// Numeric identity of a device parameter (PID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ParameterId(pub u16);

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Command class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandClass {
    Get,
    Set,
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Set => write!(f, "SET"),
        }
    }
}

/// A single protocol request
///
/// The payload is opaque to the engine; behaviors fill it in and the
/// transport encodes it.
#[derive(Debug, Clone)]
pub struct Request {
    pub command_class: CommandClass,
    pub parameter: ParameterId,
    /// Sub-device the request addresses; may differ from the run target
    /// (e.g. the all-sub-devices wildcard used by error-condition tests)
    pub sub_device: u16,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn get(parameter: ParameterId, sub_device: u16) -> Self {
        Self {
            command_class: CommandClass::Get,
            parameter,
            sub_device,
            payload: Vec::new(),
        }
    }

    pub fn set(parameter: ParameterId, sub_device: u16) -> Self {
        Self {
            command_class: CommandClass::Set,
            parameter,
            sub_device,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Reason codes a responder may attach to a rejection (E1.20 NACK reasons)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NackReason {
    UnknownPid,
    FormatError,
    HardwareFault,
    ProxyRejected,
    WriteProtect,
    UnsupportedCommandClass,
    DataOutOfRange,
    BufferFull,
    PacketSizeUnsupported,
    SubDeviceOutOfRange,
}

impl NackReason {
    /// The numeric reason code carried on the wire
    pub fn code(self) -> u16 {
        match self {
            Self::UnknownPid => 0x0000,
            Self::FormatError => 0x0001,
            Self::HardwareFault => 0x0002,
            Self::ProxyRejected => 0x0003,
            Self::WriteProtect => 0x0004,
            Self::UnsupportedCommandClass => 0x0005,
            Self::DataOutOfRange => 0x0006,
            Self::BufferFull => 0x0007,
            Self::PacketSizeUnsupported => 0x0008,
            Self::SubDeviceOutOfRange => 0x0009,
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownPid => "NR_UNKNOWN_PID",
            Self::FormatError => "NR_FORMAT_ERROR",
            Self::HardwareFault => "NR_HARDWARE_FAULT",
            Self::ProxyRejected => "NR_PROXY_REJECTED",
            Self::WriteProtect => "NR_WRITE_PROTECT",
            Self::UnsupportedCommandClass => "NR_UNSUPPORTED_COMMAND_CLASS",
            Self::DataOutOfRange => "NR_DATA_OUT_OF_RANGE",
            Self::BufferFull => "NR_BUFFER_FULL",
            Self::PacketSizeUnsupported => "NR_PACKET_SIZE_UNSUPPORTED",
            Self::SubDeviceOutOfRange => "NR_SUB_DEVICE_OUT_OF_RANGE",
        };
        write!(f, "{}", name)
    }
}

/// A decoded field value inside an acknowledged response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{:?}", v),
            Self::Bytes(v) => write!(f, "{} bytes", v.len()),
            Self::List(v) => write!(f, "[{} items]", v.len()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Decoded fields of an acknowledged response, keyed by field name
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Body of a received response
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// The request was acknowledged successfully
    Ack { fields: FieldMap },
    /// The request was rejected with a reason code
    Nack { reason: NackReason },
}

/// A response as delivered by the transport: which parameter it answers,
/// and whether it acked or nacked
#[derive(Debug, Clone)]
pub struct DeviceResponse {
    pub parameter: ParameterId,
    pub body: ResponseBody,
}

impl DeviceResponse {
    pub fn ack(parameter: ParameterId, fields: FieldMap) -> Self {
        Self {
            parameter,
            body: ResponseBody::Ack { fields },
        }
    }

    pub fn nack(parameter: ParameterId, reason: NackReason) -> Self {
        Self {
            parameter,
            body: ResponseBody::Nack { reason },
        }
    }
}

/// Outcome of one request/response exchange
///
/// `NoResponse` is synthesized by the run coordinator when the deadline
/// expires; the matcher treats it as its own response kind.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Response(DeviceResponse),
    NoResponse,
}

/// The request/response channel to one target
///
/// Implementations own encoding, transmission and decoding. The engine
/// guarantees at most one outstanding request per channel.
#[async_trait]
pub trait Transport: Send {
    /// Send one request and wait for its reply
    ///
    /// Errors represent channel trouble (device unplugged, session torn
    /// down), not protocol-level rejections: a NACK is an `Ok` response.
    async fn send(&mut self, target: &Target, request: &Request) -> Result<DeviceResponse>;
}

/// Capability and naming lookups for the target's parameters
///
/// Feeds scheduler pruning (support) and report messages (names). One
/// instance per run; stores are never shared across targets.
pub trait ParameterRegistry: Send + Sync {
    /// Whether the target declares support for this parameter
    fn is_supported(&self, parameter: ParameterId) -> bool;

    /// Human-readable parameter name, if known
    fn parameter_name(&self, parameter: ParameterId) -> Option<String>;
}

/// Format a parameter for report messages, using the registry name when
/// one is known
pub fn describe_parameter(registry: &dyn ParameterRegistry, parameter: ParameterId) -> String {
    match registry.parameter_name(parameter) {
        Some(name) => format!("{} ({})", name, parameter),
        None => parameter.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_reason_codes_match_e120() {
        assert_eq!(NackReason::UnknownPid.code(), 0x0000);
        assert_eq!(NackReason::FormatError.code(), 0x0001);
        assert_eq!(NackReason::UnsupportedCommandClass.code(), 0x0005);
        assert_eq!(NackReason::SubDeviceOutOfRange.code(), 0x0009);
    }

    #[test]
    fn request_builders() {
        let req = Request::get(ParameterId(0x0060), ROOT_DEVICE);
        assert_eq!(req.command_class, CommandClass::Get);
        assert!(req.payload.is_empty());

        let req = Request::set(ParameterId(0x00f0), 2).with_payload(vec![0x01]);
        assert_eq!(req.command_class, CommandClass::Set);
        assert_eq!(req.payload, vec![0x01]);
    }
}
