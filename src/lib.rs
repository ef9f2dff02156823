//! # scope-gateway
//!
//! WebSocket control gateway for networked telescopes.
//!
//! The gateway keeps a persistent line-delimited JSON connection to each
//! locally attached device, exposes every telescope to UI clients over a
//! WebSocket endpoint with topic subscriptions, and federates with peer
//! gateways so a command for a telescope attached elsewhere is relayed to
//! the gateway that owns it.
//!
//! ## Architecture
//!
//! ```text
//! UI clients / peer gateways (WebSocket)      HTTP (health, listings)
//!     │                                           │
//!     ├── GatewayWsManager (ws/)                  └── api/
//!     │       │
//!     │       └── TelescopeService (service/)
//!     │               ├── TelescopeRegistry ── DeviceClient (device/) ── TCP ── device
//!     │               └── RemoteLinkManager ── RemoteLinkClient (federation/) ── WS ── peer
//!     │
//!     └── EventBus (domain/) ◄── device events
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod federation;
pub mod pending;
pub mod reconnect;
pub mod service;
pub mod ws;
