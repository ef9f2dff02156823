//! Remote link connection state.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Connection state of a [`RemoteLinkClient`](super::RemoteLinkClient).
///
/// `Disconnected → Connecting → Connected → Error → Reconnecting → Connecting`.
/// `Error` is permanent once reconnection is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Not connected and not trying.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Session lost or could not be established.
    Error,
    /// Backoff elapsed, about to connect again.
    Reconnecting,
}

impl LinkState {
    /// Lowercase label reported by status queries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Returns `true` for [`LinkState::Connected`].
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
