//! Gateway-to-gateway federation: peer descriptors, per-peer WebSocket
//! links and the manager that owns them.

pub mod controller;
pub mod link_client;
pub mod link_manager;
pub mod state;

pub use controller::RemoteController;
pub use link_client::{LinkHealth, RemoteLinkClient, RemoteMessage};
pub use link_manager::RemoteLinkManager;
pub use state::LinkState;
