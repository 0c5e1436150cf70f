//! Facility-management backend HTTP client
//!
//! One method per backend operation. Operations are independent and share no state
//! beyond the pooled `reqwest::Client`.
//!
//! Fire-and-forget calls are spawned on the callback runtime handle given at
//! construction, never on the device I/O pool, and return their `JoinHandle` so
//! callers may await completion (tests do, the relay does not).
//!
//! Per-operation failure handling:
//! - facility list: one immediate retry, then empty list
//! - display init message: no retry, error returned
//! - park-in: no retry, staged image deleted whatever the outcome
//! - park-out: one immediate retry, staged image deleted only on envelope code 2xx
//! - relay/paystation notifications: no retry, failure logged and counted

use crate::domain::facility::FacilityInfo;
use crate::domain::types::{CarInfo, Direction, OutboundCarEvent, ParkInOutPayload, ResponseEnvelope};
use crate::infra::config::BackendConfig;
use crate::infra::metrics::Metrics;
use crate::io::retry::RetryPolicy;
use crate::io::staged_image;
use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backend endpoint paths
pub mod paths {
    pub const FACILITY_LIST: &str = "/v1/parkinglot/facility/list";
    pub const DISPLAY_INIT_MESSAGE: &str = "/v1/relay/display/init/message";
    pub const PARK_IN: &str = "/v1/inout/parkin";
    pub const PARK_OUT: &str = "/v1/inout/parkout";
    pub const HEALTH_CHECK: &str = "/v1/relay/health_check";
    pub const FAILURE_ALARM: &str = "/v1/relay/failure_alarm";
    pub const STATUS_NOTI: &str = "/v1/relay/status_noti";

    pub fn paystation_result(id: &str) -> String {
        format!("/v1/relay/paystation/result/{id}")
    }

    pub fn paystation_search_vehicle(id: &str) -> String {
        format!("/v1/relay/paystation/search/vehicle/{id}")
    }

    pub fn paystation_request_adjustment(id: &str) -> String {
        format!("/v1/relay/paystation/request/adjustment/{id}")
    }
}

/// Request type sent with entrance reports raised from a car event
pub const ENTRANCE_REQUEST_TYPE: &str = "IN";

/// Why a backend call failed
#[derive(Debug)]
pub enum BackendError {
    /// Connect, timeout or body transfer failure
    Transport(reqwest::Error),
    /// Non-2xx HTTP status
    Status(StatusCode),
    /// Body was not the expected envelope
    Decode(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(e) => write!(f, "transport error: {e}"),
            BackendError::Status(status) => write!(f, "unexpected status {status}"),
            BackendError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    callbacks: Handle,
    metrics: Arc<Metrics>,
}

impl BackendClient {
    /// `callbacks` runs completion work for fire-and-forget calls
    pub fn new(config: &BackendConfig, metrics: Arc<Metrics>, callbacks: Handle) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build backend HTTP client")?;

        info!(base_url = %config.base_url, "backend_client_initialized");
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            callbacks,
            metrics,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let start = Instant::now();
        let result = request.send().await;
        self.metrics.record_backend_request(start.elapsed().as_millis() as u64);

        let response = result.map_err(BackendError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }
        Ok(response)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, BackendError> {
        self.execute(self.http.post(self.url(path)).json(body)).await
    }

    async fn post_text(&self, path: &str, body: &str) -> Result<reqwest::Response, BackendError> {
        let request = self
            .http
            .post(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        self.execute(request).await
    }

    async fn post_envelope<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseEnvelope, BackendError> {
        let response = self.post_json(path, body).await?;
        response.json::<ResponseEnvelope>().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn record_failure(&self, operation: &str, e: &BackendError) {
        self.metrics.record_backend_failure();
        warn!(operation = %operation, error = %e, "backend_request_failed");
    }

    /// Facility list for this relay. Empty on any failure.
    pub async fn fetch_facility_list<Q: Serialize + ?Sized + Sync>(&self, query: &Q) -> Vec<FacilityInfo> {
        let response = RetryPolicy::IMMEDIATE_ONCE
            .run("facility_list", &self.metrics, move || self.post_json(paths::FACILITY_LIST, query))
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_failure("facility_list", &e);
                return Vec::new();
            }
        };

        if response.status() != StatusCode::OK {
            warn!(status = %response.status(), "facility_list_unexpected_status");
            return Vec::new();
        }

        let envelope = match response.json::<ResponseEnvelope>().await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "facility_list_decode_failed");
                return Vec::new();
            }
        };

        match serde_json::from_value::<Vec<FacilityInfo>>(envelope.data) {
            Ok(list) => {
                info!(count = list.len(), "facility_list_received");
                list
            }
            Err(e) => {
                error!(error = %e, "facility_list_decode_failed");
                Vec::new()
            }
        }
    }

    /// Initial display message, passed through as-is
    pub async fn request_display_init_message(&self) -> anyhow::Result<ResponseEnvelope> {
        let response = self
            .execute(self.http.get(self.url(paths::DISPLAY_INIT_MESSAGE)))
            .await
            .context("Display init message request failed")?;
        let envelope = response
            .json::<ResponseEnvelope>()
            .await
            .context("Display init message body is not a response envelope")?;
        Ok(envelope)
    }

    /// Report a recognized car by direction
    pub fn report_car_event(&self, event: OutboundCarEvent) -> JoinHandle<()> {
        debug!(direction = event.direction.as_str(), key = %event.correlation_key, "car_event_report");
        match event.direction {
            Direction::Entrance => {
                self.report_entrance_car(ENTRANCE_REQUEST_TYPE, &event.correlation_key, event.car_info)
            }
            Direction::Exit => self.report_exit_car(&event.correlation_key, event.car_info),
        }
    }

    /// Report an entrance. The staged image is deleted once the call completes,
    /// successful or not.
    pub fn report_entrance_car(&self, request_type: &str, key: &str, car: CarInfo) -> JoinHandle<()> {
        info!(
            request_type = %request_type,
            key = %key,
            dt_facilities_id = %car.dt_facilities_id,
            number = %car.number,
            path = %car.full_path.display(),
            "entrance_report_requested"
        );

        let client = self.clone();
        let key = key.to_string();
        let request_type = request_type.to_string();
        self.callbacks.spawn(async move {
            let image = staged_image::read_base64(&car.full_path).await;
            let payload = ParkInOutPayload::new(&key, &car, Some(&request_type), image);

            match client.post_json(paths::PARK_IN, &payload).await {
                Ok(_) => info!(key = %key, "entrance_report_sent"),
                Err(e) => client.record_failure("parkin", &e),
            }

            let size = staged_image::file_size(&car.full_path).await.unwrap_or(0);
            info!(key = %key, file_size = size, "entrance_image_size");
            if staged_image::delete(&car.full_path).await {
                client.metrics.record_image_deleted();
            }
        })
    }

    /// Report an exit. The staged image is deleted only when the backend answers with
    /// an envelope code in `[200, 300)`; otherwise it stays for investigation.
    pub fn report_exit_car(&self, key: &str, car: CarInfo) -> JoinHandle<()> {
        info!(
            key = %key,
            dt_facilities_id = %car.dt_facilities_id,
            number = %car.number,
            path = %car.full_path.display(),
            "exit_report_requested"
        );

        let client = self.clone();
        let key = key.to_string();
        self.callbacks.spawn(async move {
            let image = staged_image::read_base64(&car.full_path).await;
            let payload = ParkInOutPayload::new(&key, &car, None, image);

            let result = {
                let client = &client;
                let payload = &payload;
                RetryPolicy::IMMEDIATE_ONCE
                    .run("parkout", &client.metrics, move || {
                        client.post_envelope(paths::PARK_OUT, payload)
                    })
                    .await
            };

            match result {
                Ok(envelope) if envelope.is_success() => {
                    if staged_image::delete(&car.full_path).await {
                        client.metrics.record_image_deleted();
                    }
                    info!(key = %key, code = envelope.code, "exit_report_accepted");
                }
                Ok(envelope) => {
                    client.metrics.record_image_retained();
                    warn!(
                        key = %key,
                        code = envelope.code,
                        path = %car.full_path.display(),
                        "exit_report_rejected_image_retained"
                    );
                }
                Err(e) => {
                    client.record_failure("parkout", &e);
                    client.metrics.record_image_retained();
                }
            }
        })
    }

    fn fire_and_forget_json<B>(&self, operation: &'static str, path: String, body: B) -> JoinHandle<()>
    where
        B: Serialize + Send + Sync + 'static,
    {
        let client = self.clone();
        self.callbacks.spawn(async move {
            if let Err(e) = client.post_json(&path, &body).await {
                client.record_failure(operation, &e);
            }
        })
    }

    fn fire_and_forget_text(&self, operation: &'static str, path: String, body: String) -> JoinHandle<()> {
        let client = self.clone();
        self.callbacks.spawn(async move {
            if let Err(e) = client.post_text(&path, &body).await {
                client.record_failure(operation, &e);
            }
        })
    }

    pub fn send_facility_health<B: Serialize + Send + Sync + 'static>(&self, payload: B) -> JoinHandle<()> {
        self.fire_and_forget_json("health_check", paths::HEALTH_CHECK.to_string(), payload)
    }

    pub fn send_facility_alarm<B: Serialize + Send + Sync + 'static>(&self, payload: B) -> JoinHandle<()> {
        self.fire_and_forget_json("failure_alarm", paths::FAILURE_ALARM.to_string(), payload)
    }

    pub fn send_status_notification<B: Serialize + Send + Sync + 'static>(&self, payload: B) -> JoinHandle<()> {
        self.fire_and_forget_json("status_noti", paths::STATUS_NOTI.to_string(), payload)
    }

    /// Payment completed at a pay station
    pub fn send_payment_result(&self, id: &str, data: &str) -> JoinHandle<()> {
        self.fire_and_forget_text("paystation_result", paths::paystation_result(id), data.to_string())
    }

    /// Plate lookup for an unrecognized vehicle at exit
    pub fn search_vehicle(&self, id: &str, data: &str) -> JoinHandle<()> {
        self.fire_and_forget_text(
            "paystation_search_vehicle",
            paths::paystation_search_vehicle(id),
            data.to_string(),
        )
    }

    /// Adjustment request after the driver picked a vehicle
    pub fn send_payment_request(&self, id: &str, data: &str) -> JoinHandle<()> {
        self.fire_and_forget_text(
            "paystation_request_adjustment",
            paths::paystation_request_adjustment(id),
            data.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paystation_paths() {
        assert_eq!(paths::paystation_result("PAY01"), "/v1/relay/paystation/result/PAY01");
        assert_eq!(
            paths::paystation_search_vehicle("PAY01"),
            "/v1/relay/paystation/search/vehicle/PAY01"
        );
        assert_eq!(
            paths::paystation_request_adjustment("PAY01"),
            "/v1/relay/paystation/request/adjustment/PAY01"
        );
    }

    #[tokio::test]
    async fn test_url_joins_without_double_slash() {
        let config = BackendConfig { base_url: "http://gpms:8080/".to_string(), ..Default::default() };
        let client = BackendClient::new(&config, Arc::new(Metrics::new()), Handle::current()).unwrap();
        assert_eq!(client.url(paths::PARK_IN), "http://gpms:8080/v1/inout/parkin");
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back() {
        // Port 9 (discard) on loopback refuses connections
        let config = BackendConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            connect_timeout_ms: 500,
            request_timeout_ms: 500,
        };
        let metrics = Arc::new(Metrics::new());
        let client = BackendClient::new(&config, metrics.clone(), Handle::current()).unwrap();

        let list = client.fetch_facility_list(&serde_json::json!({"ip": "127.0.0.1"})).await;
        assert!(list.is_empty());
        assert_eq!(metrics.backend_retries_total(), 1);
        assert_eq!(metrics.backend_failures_total(), 1);

        assert!(client.request_display_init_message().await.is_err());

        client.send_facility_alarm(serde_json::json!({"facilitiesList": []})).await.unwrap();
        assert_eq!(metrics.backend_failures_total(), 2);
    }
}
