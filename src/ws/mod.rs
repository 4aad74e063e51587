//! Real-time side of the service: one hub actor per open document, the
//! registry that owns them and the per-socket client tasks.

pub mod client;
pub mod hub;
pub mod persist;
pub mod presence;
pub mod registry;
pub mod sync;

pub use client::serve_connection;
pub use hub::{spawn_hub, ConnId, HubCommand, HubConfig, HubHandle, HubPhase, HubSnapshot};
pub use persist::RetryPolicy;
pub use presence::{Roster, COLOR_PALETTE};
pub use registry::HubRegistry;
