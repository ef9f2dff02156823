//! Telescope service: local/remote routing and action execution.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use utoipa::ToSchema;

use super::actions::TelescopeAction;
use crate::device::DeviceClient;
use crate::domain::{TelescopeId, TelescopeRegistry};
use crate::error::GatewayError;
use crate::federation::{RemoteController, RemoteLinkClient, RemoteLinkManager};
use crate::ws::messages::{CommandResponsePayload, ControlCommandPayload, WsMessage};

/// Where a telescope is controlled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// A device client owned by this gateway.
    Local,
    /// A federation link to a peer gateway.
    Remote,
}

impl Route {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Routes control commands to the local device client or the remote link
/// owning a telescope.
///
/// Every telescope id is exactly one of local, remote or unknown:
/// registration refuses ids already claimed by the other side.
#[derive(Debug, Clone)]
pub struct TelescopeService {
    registry: Arc<TelescopeRegistry>,
    remote: Arc<RemoteLinkManager>,
}

impl TelescopeService {
    /// Creates a new `TelescopeService`.
    #[must_use]
    pub fn new(registry: Arc<TelescopeRegistry>, remote: Arc<RemoteLinkManager>) -> Self {
        Self { registry, remote }
    }

    /// Returns a reference to the local registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TelescopeRegistry> {
        &self.registry
    }

    /// Returns a reference to the remote link manager.
    #[must_use]
    pub fn remote(&self) -> &Arc<RemoteLinkManager> {
        &self.remote
    }

    /// Where `telescope_id` is controlled from, if anywhere.
    pub async fn route(&self, telescope_id: &TelescopeId) -> Option<Route> {
        if self.registry.contains(telescope_id).await {
            Some(Route::Local)
        } else if self.remote.owns(telescope_id).await {
            Some(Route::Remote)
        } else {
            None
        }
    }

    /// Every known telescope id, local first.
    pub async fn telescope_ids(&self) -> Vec<TelescopeId> {
        let mut ids = self.registry.ids().await;
        ids.sort();
        let mut remote = self.remote.telescope_ids().await;
        remote.sort();
        ids.extend(remote);
        ids
    }

    /// Registers a local device client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if a remote link serves the same
    /// id and [`GatewayError::InvalidRequest`] if it is already local.
    pub async fn register_local(&self, client: Arc<DeviceClient>) -> Result<TelescopeId, GatewayError> {
        let telescope_id = client.telescope_id().clone();
        if self.remote.owns(&telescope_id).await {
            return Err(GatewayError::Routing(format!(
                "telescope {telescope_id} is already served by a remote controller"
            )));
        }
        self.registry.insert(client).await
    }

    /// Removes and disconnects a local device client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if the id is not local.
    pub async fn unregister_local(&self, telescope_id: &TelescopeId) -> Result<Arc<DeviceClient>, GatewayError> {
        let client = self.registry.remove(telescope_id).await?;
        client.disconnect().await;
        Ok(client)
    }

    /// Adds a federation link.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if the telescope is local, plus
    /// any error of [`RemoteLinkManager::add`].
    pub async fn add_remote(&self, controller: RemoteController) -> Result<Arc<RemoteLinkClient>, GatewayError> {
        if self.registry.contains(&controller.telescope_id).await {
            return Err(GatewayError::Routing(format!(
                "telescope {} is registered locally",
                controller.telescope_id
            )));
        }
        self.remote.add(controller).await
    }

    /// Removes a federation link.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if no such link exists.
    pub async fn remove_remote(&self, controller_id: &str) -> Result<RemoteController, GatewayError> {
        self.remote.remove(controller_id).await
    }

    /// Validates and executes `command` on `telescope_id`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Routing`] if the telescope is unknown.
    /// - [`GatewayError::Connection`] if the owning client or link is down.
    /// - [`GatewayError::InvalidRequest`] for unknown actions or bad
    ///   parameters.
    /// - [`GatewayError::Timeout`] / [`GatewayError::Command`] as reported
    ///   by the device or peer.
    pub async fn execute(
        &self,
        telescope_id: &TelescopeId,
        command: &ControlCommandPayload,
    ) -> Result<Value, GatewayError> {
        let route = self.route(telescope_id).await.ok_or_else(|| {
            GatewayError::Routing(format!("telescope {telescope_id} is not registered"))
        })?;
        let action = TelescopeAction::parse(&command.action, &command.parameters)?;
        tracing::debug!(%telescope_id, action = action.name(), route = route.as_str(), "executing action");

        match route {
            Route::Local => {
                let client = self.registry.get(telescope_id).await.ok_or_else(|| {
                    GatewayError::Routing(format!("telescope {telescope_id} is not registered"))
                })?;
                if !client.is_online().await {
                    return Err(GatewayError::Connection(format!("telescope {telescope_id} is offline")));
                }
                execute_local(&client, &action).await
            }
            Route::Remote => {
                let message = WsMessage::control_command(
                    telescope_id.clone(),
                    &command.action,
                    command.parameters.clone(),
                    true,
                );
                match self.remote.send_to_telescope(telescope_id, message).await? {
                    Some(response) => {
                        let payload: CommandResponsePayload = response.payload_as()?;
                        if payload.success {
                            Ok(payload.result.unwrap_or(Value::Null))
                        } else {
                            Err(GatewayError::Command(
                                payload.error.unwrap_or_else(|| "remote command failed".to_string()),
                            ))
                        }
                    }
                    None => Ok(Value::Null),
                }
            }
        }
    }
}

/// Runs `action` against a connected local client.
async fn execute_local(client: &DeviceClient, action: &TelescopeAction) -> Result<Value, GatewayError> {
    match action {
        TelescopeAction::GetStatus => Ok(serde_json::to_value(client.status().await)?),
        TelescopeAction::FocusIncrement { increment } => {
            let current = match client.status().await.focuser_position {
                Some(position) => position,
                None => {
                    let reported = client.call("get_focuser_position", None).await?;
                    reported
                        .as_i64()
                        .or_else(|| reported.get("step").and_then(Value::as_i64))
                        .ok_or_else(|| GatewayError::Command("focuser position unavailable".to_string()))?
                }
            };
            let target = current.saturating_add(*increment);
            client
                .call("move_focuser", Some(json!({ "step": target, "ret_step": true })))
                .await
        }
        other => match other.device_request() {
            Some((method, params)) => client.call(method, params).await,
            None => Err(GatewayError::Internal(format!(
                "action {} has no device request",
                other.name()
            ))),
        },
    }
}
