//! Relay hub wire protocol
//!
//! The relay hub speaks a JSON record protocol over a raw WebSocket
//! (negotiation is skipped, the transport is fixed). Records are
//! `0x1e`-terminated JSON documents: a handshake exchange first, then
//! invocation records (`type: 1`) carrying a target name and positional
//! arguments, plus keepalive pings (`type: 6`).
//!
//! Inbound `MESSAGE` invocations carry a [`SignalEnvelope`] whose `data`
//! field is itself a JSON-encoded payload keyed by the envelope `type`.
//! Envelopes are decoded once, at the channel boundary, into the closed
//! [`SignalEvent`] type; unknown envelope types become
//! [`SignalEvent::Unhandled`] rather than silently matching no branch.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record separator terminating every hub record
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Invocation record type
pub const RECORD_INVOCATION: u8 = 1;

/// Keepalive ping record type
pub const RECORD_PING: u8 = 6;

/// Hub method invoked to relay a payload to a device
pub const TARGET_SEND_TO_DEVICE: &str = "SendToDevice";

/// Hub method registering interest in a device's message group
pub const TARGET_JOIN_GROUP: &str = "AddDeviceToGroup";

/// Inbound invocation target carrying a signal envelope
pub const TARGET_MESSAGE: &str = "MESSAGE";

/// Envelope type constants
pub mod envelope_kind {
    /// Display-geometry metadata from the device
    pub const TRANSFER_INFO: &str = "TRANSFER_INFO";
    /// Negotiation traffic (offers and candidates)
    pub const TRANSFER_SDP: &str = "TRANSFER_SDP";
    /// Device presence: came online
    pub const DEVICE_CONNECTED: &str = "DEVICE_CONNECTED";
    /// Device presence: went offline
    pub const DEVICE_DISCONNECTED: &str = "DEVICE_DISCONNECTED";
}

/// A hub record as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubRecord {
    /// Record type (1 = invocation, 6 = ping)
    #[serde(rename = "type")]
    pub kind: u8,

    /// Invocation target name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Positional invocation arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<Value>>,
}

impl HubRecord {
    /// Build an invocation record
    pub fn invocation(target: &str, arguments: Vec<Value>) -> Self {
        Self {
            kind: RECORD_INVOCATION,
            target: Some(target.to_string()),
            arguments: Some(arguments),
        }
    }

    /// Build a keepalive ping record
    pub fn ping() -> Self {
        Self {
            kind: RECORD_PING,
            target: None,
            arguments: None,
        }
    }

    /// Serialize to a separator-terminated wire record
    pub fn encode(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize hub record: {}", e)))?;
        json.push(RECORD_SEPARATOR);
        Ok(json)
    }
}

/// The handshake record opening every hub connection
pub fn handshake_record() -> String {
    format!("{{\"protocol\":\"json\",\"version\":1}}{}", RECORD_SEPARATOR)
}

/// Drain complete (separator-terminated) records from `buf`, leaving any
/// trailing partial record in place
pub fn drain_records(buf: &mut String) -> Vec<String> {
    let mut records = Vec::new();
    while let Some(idx) = buf.find(RECORD_SEPARATOR) {
        let mut record: String = buf.drain(..=idx).collect();
        record.pop();
        if !record.is_empty() {
            records.push(record);
        }
    }
    records
}

/// Wire envelope exchanged over the relay channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    /// Envelope type discriminator
    #[serde(rename = "type")]
    pub kind: String,

    /// Target or originating device identifier
    #[serde(rename = "deviceId")]
    pub device_id: String,

    /// JSON-encoded nested payload, shape keyed by `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Nested `TRANSFER_SDP` payload: the offer/answer/candidate union
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SdpSignal {
    /// Remote offer, carrying per-negotiation ICE server descriptors
    #[serde(rename = "offer")]
    Offer {
        /// Offer SDP
        sdp: String,
        /// Pipe-delimited ICE server descriptors for this negotiation
        #[serde(default)]
        ice: Vec<String>,
    },

    /// Local answer sent back to the originating device
    #[serde(rename = "answer")]
    Answer {
        /// Answer SDP
        sdp: String,
    },

    /// A single trickled ICE candidate
    #[serde(rename = "candidate")]
    Candidate {
        /// Media section identifier
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
        /// Media line index
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
        /// Candidate string
        candidate: String,
    },
}

impl SdpSignal {
    /// Serialize to the nested JSON form carried in an envelope `data` field
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize SDP payload: {}", e)))
    }
}

/// Display-geometry payload carried by `TRANSFER_INFO`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferInfo {
    /// Device display width in pixels
    pub width: u32,
    /// Device display height in pixels
    pub height: u32,
}

/// Typed inbound signaling event, decoded once at the channel boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Display-geometry metadata from the device
    TransferInfo {
        /// Originating device
        device_id: String,
        /// Geometry payload
        info: TransferInfo,
    },

    /// Negotiation traffic
    Sdp {
        /// Originating device
        device_id: String,
        /// Offer or candidate payload
        signal: SdpSignal,
    },

    /// Device came online
    DeviceConnected {
        /// Device identifier
        device_id: String,
    },

    /// Device went offline
    DeviceDisconnected {
        /// Device identifier
        device_id: String,
    },

    /// Envelope type this client does not handle
    Unhandled {
        /// The unrecognized envelope type
        kind: String,
        /// Device identifier carried on the envelope
        device_id: String,
    },
}

impl SignalEvent {
    /// Decode a wire envelope into a typed event
    ///
    /// A missing or malformed nested payload is a [`Error::Parse`]; callers
    /// drop the message and keep the channel alive.
    pub fn decode(envelope: SignalEnvelope) -> Result<Self> {
        let SignalEnvelope {
            kind,
            device_id,
            data,
        } = envelope;

        match kind.as_str() {
            envelope_kind::TRANSFER_INFO => {
                let data = data.ok_or_else(|| {
                    Error::Parse("TRANSFER_INFO envelope without data".to_string())
                })?;
                let info: TransferInfo = serde_json::from_str(&data).map_err(|e| {
                    Error::Parse(format!("Malformed TRANSFER_INFO payload: {}", e))
                })?;
                Ok(SignalEvent::TransferInfo { device_id, info })
            }
            envelope_kind::TRANSFER_SDP => {
                let data = data
                    .ok_or_else(|| Error::Parse("TRANSFER_SDP envelope without data".to_string()))?;
                let signal: SdpSignal = serde_json::from_str(&data)
                    .map_err(|e| Error::Parse(format!("Malformed TRANSFER_SDP payload: {}", e)))?;
                Ok(SignalEvent::Sdp { device_id, signal })
            }
            envelope_kind::DEVICE_CONNECTED => Ok(SignalEvent::DeviceConnected { device_id }),
            envelope_kind::DEVICE_DISCONNECTED => Ok(SignalEvent::DeviceDisconnected { device_id }),
            _ => Ok(SignalEvent::Unhandled { kind, device_id }),
        }
    }
}

/// Normalize a `MESSAGE` invocation argument into an envelope
///
/// The hub delivers envelopes either as JSON objects or as raw strings
/// containing JSON; both forms are accepted.
pub fn decode_message_argument(argument: &Value) -> Result<SignalEnvelope> {
    match argument {
        Value::String(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::Parse(format!("Malformed envelope string: {}", e))),
        Value::Object(_) => serde_json::from_value(argument.clone())
            .map_err(|e| Error::Parse(format!("Malformed envelope object: {}", e))),
        other => Err(Error::Parse(format!(
            "Envelope is neither string nor object: {}",
            other
        ))),
    }
}
