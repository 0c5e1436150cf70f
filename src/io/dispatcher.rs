//! Inbound dispatcher - per-connection message handling
//!
//! Installed by the connection registry as the handler for every device session.
//! Frames on one session arrive in order on a single task, so the dispatcher itself
//! holds no per-connection state and is shared by all sessions.
//!
//! Routing:
//! - frame contains `GATE` -> breaker signal, sanitized and logged
//! - anything else -> pay-station JSON; `vehicleListSearch`, `adjustmentRequest` and
//!   `payment` resolve the originating facility and go to the `PayStationForwarder`

use crate::domain::facility::{FacilityInfo, FacilityResolver};
use crate::domain::message::{
    sanitize_breaker, InboundMessage, MessageCategory, PayStationEvent, PayStationType,
};
use crate::infra::metrics::Metrics;
use crate::io::notifier::{UiEvent, UiNotifier};
use crate::io::registry::{ConnectionContext, ConnectionHandler};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Extension point for pay-station events that carry a facility.
///
/// The backend calls for these events are not wired yet; the default forwarder only
/// logs. Implementations must not block: they run on the device I/O task.
pub trait PayStationForwarder: Send + Sync {
    fn forward(
        &self,
        conn: &ConnectionContext,
        event: &PayStationEvent,
        facility: Option<&FacilityInfo>,
    );
}

/// Default forwarder: no backend call
pub struct NoForwarding;

impl PayStationForwarder for NoForwarding {
    fn forward(
        &self,
        conn: &ConnectionContext,
        event: &PayStationEvent,
        facility: Option<&FacilityInfo>,
    ) {
        debug!(
            remote = %conn.remote_addr,
            kind = %event.kind,
            facility = facility.map(|f| f.facilities_id.as_str()).unwrap_or("-"),
            "paystation_forward_not_wired"
        );
    }
}

/// Why a frame was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    InvalidUtf8,
    MalformedPayload,
}

/// What the dispatcher did with one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Breaker signal after sanitization
    Breaker(String),
    /// Facility lookup done (`None` = no facility bound to the address)
    Resolved { kind: PayStationType, facility: Option<FacilityInfo> },
    /// Pay-station type with no action
    Ignored(PayStationType),
    Dropped(DropReason),
}

pub struct InboundDispatcher {
    resolver: Arc<dyn FacilityResolver>,
    notifier: Arc<dyn UiNotifier>,
    forwarder: Arc<dyn PayStationForwarder>,
    metrics: Arc<Metrics>,
}

impl InboundDispatcher {
    pub fn new(
        resolver: Arc<dyn FacilityResolver>,
        notifier: Arc<dyn UiNotifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { resolver, notifier, forwarder: Arc::new(NoForwarding), metrics }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn PayStationForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Classify and handle one frame
    pub fn dispatch(&self, conn: &ConnectionContext, frame: &[u8]) -> Dispatch {
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(remote = %conn.remote_addr, error = %e, len = frame.len(), "frame_invalid_utf8");
                return Dispatch::Dropped(DropReason::InvalidUtf8);
            }
        };

        let message = InboundMessage::new(conn.host.as_str(), text);
        match message.category {
            MessageCategory::BreakerSignal => {
                self.metrics.record_breaker_frame();
                Dispatch::Breaker(self.receive_breaker_message(conn, &message.raw_text))
            }
            MessageCategory::PayStationEvent => {
                self.metrics.record_paystation_frame();
                self.receive_pay_station_message(conn, &message)
            }
        }
    }

    fn receive_breaker_message(&self, conn: &ConnectionContext, text: &str) -> String {
        let signal = sanitize_breaker(text);
        info!(host = %conn.host, signal = %signal, "breaker_message_received");
        signal
    }

    fn receive_pay_station_message(
        &self,
        conn: &ConnectionContext,
        message: &InboundMessage,
    ) -> Dispatch {
        let event = match PayStationEvent::decode(&message.raw_text) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(
                    host = %message.source_host,
                    remote = %conn.remote_addr,
                    error = %e,
                    "paystation_payload_malformed"
                );
                return Dispatch::Dropped(DropReason::MalformedPayload);
            }
        };

        if !event.kind.needs_facility() {
            debug!(host = %message.source_host, kind = %event.kind, "paystation_message_ignored");
            return Dispatch::Ignored(event.kind);
        }

        let facility = self.resolver.resolve(&conn.remote_addr);
        self.metrics.record_facility_lookup(facility.is_some());

        match &facility {
            Some(f) => info!(
                remote = %conn.remote_addr,
                kind = %event.kind,
                facility = %f.facilities_id,
                "paystation_message_received"
            ),
            None => warn!(remote = %conn.remote_addr, kind = %event.kind, "paystation_facility_not_found"),
        }

        self.forwarder.forward(conn, &event, facility.as_ref());
        Dispatch::Resolved { kind: event.kind, facility }
    }
}

impl ConnectionHandler for InboundDispatcher {
    fn on_connected(&self, conn: &ConnectionContext) {
        debug!(host = %conn.host, remote = %conn.remote_addr, "ui_notify_connect");
        self.notifier.notify(UiEvent::Connect);
    }

    fn on_disconnected(&self, conn: &ConnectionContext) {
        debug!(host = %conn.host, remote = %conn.remote_addr, "ui_notify_disconnect");
        self.notifier.notify(UiEvent::Disconnect);
    }

    fn on_frame(&self, conn: &ConnectionContext, frame: &[u8]) {
        self.dispatch(conn, frame);
    }

    fn on_error(&self, conn: &ConnectionContext, cause: &std::io::Error) {
        error!(remote = %conn.remote_addr, host = %conn.host, error = %cause, "tcp_connection_error");
    }
}
