//! Car events and backend wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Generic backend envelope: numeric `code` plus opaque `data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i64,
    #[serde(default)]
    pub data: Value,
}

impl ResponseEnvelope {
    /// Backend-level success: `200 <= code < 300`
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Vehicle recognized at a breaker, with its staged capture image
#[derive(Debug, Clone, PartialEq)]
pub struct CarInfo {
    /// Recognized plate number
    pub number: String,
    pub dt_facilities_id: String,
    /// Staged image written by the recognition camera
    pub full_path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Entrance,
    Exit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entrance => "entrance",
            Direction::Exit => "exit",
        }
    }
}

/// Entrance or exit to report to the backend
#[derive(Debug, Clone)]
pub struct OutboundCarEvent {
    pub correlation_key: String,
    pub car_info: CarInfo,
    pub direction: Direction,
}

/// Body of `/v1/inout/parkin` and `/v1/inout/parkout`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkInOutPayload {
    /// Correlation key tying the event to one backend transaction
    pub key: String,
    /// Entrance request type (e.g. `IN`, `RECOGNITION`); absent on exit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub dt_facilities_id: String,
    pub vehicle_no: String,
    pub date: DateTime<Utc>,
    /// Base64 encoded staged image, absent when the file could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ParkInOutPayload {
    pub fn new(key: &str, car: &CarInfo, request_type: Option<&str>, image: Option<String>) -> Self {
        Self {
            key: key.to_string(),
            r#type: request_type.map(str::to_string),
            dt_facilities_id: car.dt_facilities_id.clone(),
            vehicle_no: car.number.clone(),
            date: car.captured_at,
            image,
        }
    }
}
