//! Outbound HTTP: the DPoP-signed network client and the admission gate
//! that keeps it inside the network's published rate limits.

pub mod network;
pub mod rate_gate;

pub use network::{
    NetworkClient, POST_COLLECTION, PostRecord, PublishedRecord, RecordPublisher,
    RecordRef, ReplyRef, trailing_path_segment,
};
pub use rate_gate::{ENDPOINT_API, ENDPOINT_OAUTH, GateSnapshot, RateGate};
