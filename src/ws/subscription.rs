//! Per-connection subscription table.
//!
//! Tracks, for a single WebSocket connection, which topics it wants for
//! each telescope and provides server-side event filtering. Sets grow by
//! union; [`SubscriptionTopic::All`] matches every topic query.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::TelescopeId;

/// Named status category a connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTopic {
    /// Wildcard.
    All,
    /// Power, thermal and aggregate status.
    Status,
    /// Stacking, filter wheel and annotations.
    Imaging,
    /// Mount pointing and view state.
    Position,
    /// Focuser.
    Focus,
    /// Client mode and monitored conditions.
    System,
}

impl SubscriptionTopic {
    /// Parses a topic name case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "status" => Some(Self::Status),
            "imaging" => Some(Self::Imaging),
            "position" => Some(Self::Position),
            "focus" => Some(Self::Focus),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Status => "status",
            Self::Imaging => "imaging",
            Self::Position => "position",
            Self::Focus => "focus",
            Self::System => "system",
        }
    }
}

/// Subscriptions of a single WebSocket connection.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionManager {
    topics: HashMap<TelescopeId, HashSet<SubscriptionTopic>>,
}

impl SubscriptionManager {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `topics` for `telescope_id`.
    pub fn subscribe(&mut self, telescope_id: &TelescopeId, topics: &[SubscriptionTopic]) {
        if topics.is_empty() {
            return;
        }
        self.topics
            .entry(telescope_id.clone())
            .or_default()
            .extend(topics.iter().copied());
    }

    /// Removes `topics` for `telescope_id`. Removing [`SubscriptionTopic::All`]
    /// drops the telescope entirely; so does emptying its set.
    pub fn unsubscribe(&mut self, telescope_id: &TelescopeId, topics: &[SubscriptionTopic]) {
        if topics.contains(&SubscriptionTopic::All) {
            self.topics.remove(telescope_id);
            return;
        }
        let Some(set) = self.topics.get_mut(telescope_id) else {
            return;
        };
        for topic in topics {
            set.remove(topic);
        }
        if set.is_empty() {
            self.topics.remove(telescope_id);
        }
    }

    /// Returns `true` if events of `topic` for `telescope_id` should be
    /// delivered.
    #[must_use]
    pub fn is_subscribed_to(&self, telescope_id: &TelescopeId, topic: SubscriptionTopic) -> bool {
        self.topics
            .get(telescope_id)
            .is_some_and(|set| set.contains(&SubscriptionTopic::All) || set.contains(&topic))
    }

    /// Topics held for `telescope_id`.
    #[must_use]
    pub fn topics(&self, telescope_id: &TelescopeId) -> Option<&HashSet<SubscriptionTopic>> {
        self.topics.get(telescope_id)
    }

    /// Telescopes with at least one topic.
    pub fn telescope_ids(&self) -> impl Iterator<Item = &TelescopeId> {
        self.topics.keys()
    }

    /// Number of telescopes with at least one topic.
    #[must_use]
    pub fn count(&self) -> usize {
        self.topics.len()
    }
}
