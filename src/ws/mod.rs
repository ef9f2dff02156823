//! WebSocket layer: the gateway manager, connection loop, wire messages
//! and per-connection subscriptions.
//!
//! UI clients connect at `/ws` (or `/ws/{telescope_id}` to default every
//! message to one telescope) and exchange [`messages::WsMessage`]
//! envelopes. Peer gateways use the same endpoint for federation.

pub mod connection;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod subscription;

pub use manager::GatewayWsManager;
pub use messages::{WsMessage, WsMessageType};
pub use subscription::{SubscriptionManager, SubscriptionTopic};
