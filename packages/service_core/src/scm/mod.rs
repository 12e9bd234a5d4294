//! The OS service control surface consumed by the rest of the crate.
//!
//! Handles returned by the traits below close their OS counterpart on drop.

use std::path::PathBuf;
use std::sync::Arc;

use crate::os_error::OsError;
use crate::status::{
    ControlResult, ErrorControl, NotifyMask, ServiceControl, ServiceStatus, ServiceType, StartType,
    StatusNotify,
};

pub mod memory;
#[cfg(windows)]
pub mod windows;

/// Receives control requests for one running service.
pub type ControlHandler = Box<dyn Fn(ServiceControl) -> ControlResult + Send + Sync + 'static>;

/// Entry point run by the dispatcher when the OS starts a hosted service.
/// Receives the OS supplied arguments, the first being the service name.
pub type ServiceEntry = Arc<dyn Fn(Vec<String>) + Send + Sync + 'static>;

pub trait ScmBackend: Send + Sync {
    /// Opens the service registry, enumerate-only when `query_only`.
    fn open_manager(&self, query_only: bool) -> Result<Box<dyn ScmManager>, OsError>;

    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> Result<Box<dyn StatusReporter>, OsError>;

    /// Blocks the calling thread, routing service starts to the table's entry point
    /// until every hosted service has stopped.
    fn run_dispatcher(&self, table: DispatchTable) -> Result<(), OsError>;

    fn current_session_id(&self) -> Result<u32, OsError>;
}

pub trait ScmManager: Send {
    fn create_service(&self, info: &ServiceInstallInfo) -> Result<(), OsError>;

    fn open_service(&self, name: &str, query_only: bool) -> Result<Box<dyn ScmService>, OsError>;
}

pub trait ScmService: Send {
    fn start(&self) -> Result<(), OsError>;

    fn control(&self, control: ServiceControl) -> Result<ServiceStatus, OsError>;

    fn query_status(&self) -> Result<ServiceStatus, OsError>;

    /// Marks the registration for removal once every handle is closed.
    fn delete(&self) -> Result<(), OsError>;

    /// One-shot notification fired when the service enters a state in `mask`.
    fn notify_status_change(&self, mask: NotifyMask, notify: StatusNotify) -> Result<(), OsError>;
}

pub trait StatusReporter: Send + Sync {
    fn set_status(&self, status: &ServiceStatus) -> Result<(), OsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstallInfo {
    pub name: String,
    pub display_name: String,
    pub binary_path: PathBuf,
    pub arguments: Vec<String>,
    pub service_type: ServiceType,
    pub start_type: StartType,
    pub error_control: ErrorControl,
}

impl ServiceInstallInfo {
    pub fn command_line(&self) -> String {
        let mut line = format!("\"{}\"", self.binary_path.display());
        for arg in &self.arguments {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

pub struct DispatchTable {
    pub names: Vec<String>,
    pub entry: ServiceEntry,
}

impl DispatchTable {
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// The service control manager of the running platform.
#[cfg(windows)]
pub fn native() -> Result<Arc<dyn ScmBackend>, OsError> {
    Ok(Arc::new(windows::WindowsScm::default()))
}

#[cfg(not(windows))]
pub fn native() -> Result<Arc<dyn ScmBackend>, OsError> {
    Err(OsError::NOT_SUPPORTED)
}
