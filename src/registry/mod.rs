//! Bridge registry: the persisted desired state of the worker fleet.

pub mod record;
pub mod store;

pub use record::{
    sanitize_id, BridgeInfo, BridgeKind, BridgeRecord, PortRange, DEFAULT_ADVERTISER, HUB_ID,
};
pub use store::{RecordUpdate, Registry};
