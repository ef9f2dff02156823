//! Device protocol layer: TCP transport, wire frames and the per-telescope
//! client.

pub mod client;
pub mod connection;
pub mod frame;
pub mod monitor;

pub use client::{DeviceClient, DeviceClientConfig, FIRST_REQUEST_ID};
pub use connection::{Connection, ConnectionConfig};
pub use frame::{DeviceRequest, DeviceResponse};
pub use monitor::ConditionMonitor;
