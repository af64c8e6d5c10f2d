pub mod api;
pub mod client;
pub mod error;
pub mod messages;

pub use api::{InboundMessage, Penalty, PenaltyReason, PeerId, SentPeers, SentryApi, StatusData};
pub use client::SentryClient;
pub use error::SentryError;
