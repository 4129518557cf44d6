//! Session lifecycle: per-account connection actors and the registry that
//! owns them.

mod backoff;
mod manager;
mod registry;
mod state;

pub use backoff::BackoffPolicy;
pub use manager::SessionHandle;
pub use registry::SessionRegistry;
pub use state::{ConnectionState, FailureKind, SessionFailure, SessionStatus};
