pub mod config;
pub mod field;
pub mod form;
pub mod http;
pub mod node;
pub mod options;
pub mod page;
pub mod portal;
pub mod record;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod topics;

pub use config::{ConfigField, DeviceConfig};
pub use http::{AbandonFlag, Method, PendingRequest, PortalRequest, PortalResponse, RequestQueue};
pub use node::{NodeAction, NodeRuntime, NodeTimings};
pub use options::{BuildOptions, BUILD_OPTIONS};
pub use portal::{
    ActivePortal, ConfigPortal, InertPortal, NetworkLink, PortalError, PortalState, PortalTick,
    SharedConfig,
};
pub use record::{PersistedRecord, RECORD_SIZE};
pub use storage::{ByteStorage, RegionBuffer, StorageError};
pub use store::{ConfigStore, LoadOutcome, Persistence};
pub use telemetry::{Reading, TelemetryError, TelemetryFormatter};
pub use topics::*;
