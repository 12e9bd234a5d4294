pub mod handle;
pub mod implementation;
pub mod manager;
pub mod os_error;
pub mod registry;
pub mod scm;
pub mod status;
pub mod sync;
pub mod thread_owner;

pub use handle::ServiceHandle;
pub use implementation::{HookOutcome, ServiceImplementation, ServiceLifecycle, ServiceState};
pub use manager::ServiceManager;
pub use os_error::OsError;
pub use registry::{RegistryError, ServiceRegistry};
pub use status::{ControlResult, ServiceControl, ServiceStateKind, ServiceStatus};
pub use thread_owner::{ThreadControl, ThreadOwner, ThreadState, ThreadWorker};
