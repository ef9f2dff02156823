//! Domain layer: telescope identity, device status, the internal event
//! system and the local telescope registry.

pub mod device_event;
pub mod device_status;
pub mod event_bus;
pub mod telescope_id;
pub mod telescope_registry;

pub use device_event::{DeviceEvent, EventKind};
pub use device_status::{
    ClientMode, ClientModeChange, DeviceStateSnapshot, DeviceStatus, FocuserState,
    PiStatusUpdate, StatusChanges, ViewState,
};
pub use event_bus::{EventBus, KindSubscription};
pub use telescope_id::TelescopeId;
pub use telescope_registry::{TelescopeRegistry, TelescopeSummary};
