//! Optional external condition monitors attached to a device client.

use async_trait::async_trait;

use crate::error::GatewayError;

/// A boolean condition polled at a fixed interval.
///
/// The owning [`DeviceClient`](super::DeviceClient) publishes a
/// `ConditionChanged` event whenever the observed value differs from the
/// previous observation (the first observation always counts).
#[async_trait]
pub trait ConditionMonitor: Send + Sync {
    /// Name published with every transition.
    fn name(&self) -> &str;

    /// Samples the condition.
    ///
    /// # Errors
    ///
    /// Any error skips this sample; the previous value is kept.
    async fn check(&self) -> Result<bool, GatewayError>;
}
