mod discovery;
mod types;

pub use discovery::{Discovery, validate_dense};
#[cfg(feature = "status-output")]
pub use discovery::detect_status_output;
pub use types::{
    InstanceId, InstanceInfo, InstanceState, LOG_FILE, Position, STATUS_FILE, StateKind, Update,
};
