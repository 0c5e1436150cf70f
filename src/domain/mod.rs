//! Domain models - facility identity, device messages and backend payloads
//!
//! - `facility` - Facility bindings (address -> facility identity) and the lookup table
//! - `message` - Inbound device frames, classification and pay-station events
//! - `types` - Car events and backend request/response envelopes

pub mod facility;
pub mod message;
pub mod types;

pub use facility::{FacilityInfo, FacilityResolver, FacilityTable};
pub use message::{InboundMessage, MessageCategory, PayStationEvent, PayStationType};
pub use types::{CarInfo, Direction, OutboundCarEvent, ParkInOutPayload, ResponseEnvelope};
