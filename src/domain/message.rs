//! Inbound device messages
//!
//! Two device protocols share the same TCP transport:
//! - Breakers send short text signals that always contain `GATE`
//! - Pay stations send a JSON object, optionally behind a `label|` prefix
//!
//! Classification is a plain substring check so the high-volume breaker channel never
//! pays for a JSON parse.

use serde_json::{Map, Value};
use std::fmt;

/// Substring that marks a frame as a breaker signal
pub const BREAKER_MARKER: &str = "GATE";

/// Pay-station message type, taken from the `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayStationType {
    VehicleListSearch,
    AdjustmentRequest,
    Payment,
    PaymentFailure,
    HealthCheck,
    Unrecognized(String),
}

impl PayStationType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "vehicleListSearch" => Self::VehicleListSearch,
            "adjustmentRequest" => Self::AdjustmentRequest,
            "payment" => Self::Payment,
            "paymentFailure" => Self::PaymentFailure,
            "healthCheck" => Self::HealthCheck,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::VehicleListSearch => "vehicleListSearch",
            Self::AdjustmentRequest => "adjustmentRequest",
            Self::Payment => "payment",
            Self::PaymentFailure => "paymentFailure",
            Self::HealthCheck => "healthCheck",
            Self::Unrecognized(other) => other,
        }
    }

    /// Types whose originating facility must be resolved before forwarding
    pub fn needs_facility(&self) -> bool {
        matches!(self, Self::VehicleListSearch | Self::AdjustmentRequest | Self::Payment)
    }
}

impl fmt::Display for PayStationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded pay-station frame
#[derive(Debug, Clone, PartialEq)]
pub struct PayStationEvent {
    pub kind: PayStationType,
    pub payload: Map<String, Value>,
}

impl PayStationEvent {
    /// Decode a pay-station frame.
    ///
    /// Accepts a bare JSON object or `label|{...}`. A missing `type` decodes as an
    /// unrecognized empty type, a non-string `type` uses its JSON text.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let trimmed = text.trim();
        let body = if trimmed.starts_with('{') {
            trimmed
        } else {
            trimmed.split_once('|').map(|(_, rest)| rest.trim()).unwrap_or(trimmed)
        };

        let payload: Map<String, Value> = serde_json::from_str(body)?;
        let kind = match payload.get("type") {
            Some(Value::String(s)) => PayStationType::parse(s),
            Some(Value::Null) | None => PayStationType::parse(""),
            Some(other) => PayStationType::parse(&other.to_string()),
        };

        Ok(Self { kind, payload })
    }
}

/// What a frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum MessageCategory {
    BreakerSignal,
    PayStationEvent,
}

/// One unit of work derived from one inbound frame
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source_host: String,
    pub raw_text: String,
    pub category: MessageCategory,
}

impl InboundMessage {
    pub fn new(source_host: impl Into<String>, raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let category = classify(&raw_text);
        Self { source_host: source_host.into(), raw_text, category }
    }
}

pub fn classify(text: &str) -> MessageCategory {
    if text.contains(BREAKER_MARKER) {
        MessageCategory::BreakerSignal
    } else {
        MessageCategory::PayStationEvent
    }
}

/// Keep ASCII letters and whitespace, drop everything else (`[^a-zA-Z\s]`)
pub fn sanitize_breaker(text: &str) -> String {
    text.chars()
        .filter(|c| {
            c.is_ascii_alphabetic() || matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
        })
        .collect()
}
