pub mod archive;
pub mod clienv;
pub mod error;
pub mod events;
pub mod hub;
pub mod monitor;
pub mod paths;
pub mod registry;
pub mod rpc;
pub mod settings;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use error::{HubError, Result};
pub use events::{EventBus, HubEvent};
pub use hub::Hub;
pub use paths::Paths;
pub use registry::{BridgeRecord, Registry};
pub use supervisor::Supervisor;
