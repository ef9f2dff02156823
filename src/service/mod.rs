//! Service layer: the telescope action table and command routing.
//!
//! [`TelescopeService`] decides whether a telescope is local or remote and
//! runs validated [`TelescopeAction`]s against the owning client.

pub mod actions;
pub mod telescope_service;

pub use actions::TelescopeAction;
pub use telescope_service::{Route, TelescopeService};
