//! IO modules - external system interfaces
//!
//! - `registry` - Outbound TCP sessions to field devices, reconnect supervision
//! - `framing` - Frame splitting for the device byte stream
//! - `dispatcher` - Inbound frame routing (breaker signals, pay-station events)
//! - `notifier` - UI connect/disconnect notifications over MQTT
//! - `backend` - Facility-management backend HTTP client
//! - `retry` - Backend retry policy
//! - `staged_image` - Vehicle images staged on disk for park-in/out reports
//! - `prometheus` - Metrics and operator control HTTP endpoint

pub mod backend;
pub mod dispatcher;
pub mod framing;
pub mod notifier;
pub mod prometheus;
pub mod registry;
pub mod retry;
pub mod staged_image;

// Re-export commonly used types
pub use backend::{BackendClient, BackendError};
pub use dispatcher::{Dispatch, DropReason, InboundDispatcher, NoForwarding, PayStationForwarder};
pub use notifier::{create_notify_channel, DisabledNotifier, MqttNotifier, NotifySender, UiEvent, UiNotifier};
pub use registry::{
    ConnectionContext, ConnectionHandler, ConnectionRegistry, ConnectionState, RegistryConfig,
};
pub use retry::RetryPolicy;
