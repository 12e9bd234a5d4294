//! Access to the OS service registry.

use std::path::Path;

use crate::os_error::OsError;
use crate::scm::{ScmBackend, ScmManager, ServiceInstallInfo};
use crate::status::{ErrorControl, ServiceType, StartType};

/// An open connection to the service registry.
///
/// Opening can fail. The failure is logged and the manager is left without a
/// handle, so callers check [`ServiceManager::handle`] before using it.
pub struct ServiceManager {
    handle: Option<Box<dyn ScmManager>>,
}

impl ServiceManager {
    /// Service type every registration made by this crate uses.
    pub const SERVICE_TYPE: ServiceType = ServiceType::OwnProcess;

    pub fn new(scm: &dyn ScmBackend, query_only: bool) -> Self {
        let handle = match scm.open_manager(query_only) {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::error!(%error, query_only, "failed to open service manager");
                None
            }
        };

        ServiceManager { handle }
    }

    pub fn handle(&self) -> Option<&dyn ScmManager> {
        self.handle.as_deref()
    }

    /// Registers `binary` as a demand start service launched as `"<binary>" <name>`,
    /// letting one executable host several named services.
    pub fn install(&self, name: &str, binary: &Path) -> Result<(), OsError> {
        self.install_with_display_name(name, name, binary)
    }

    pub fn install_with_display_name(
        &self,
        name: &str,
        display_name: &str,
        binary: &Path,
    ) -> Result<(), OsError> {
        let Some(handle) = self.handle() else {
            return Err(OsError::ACCESS_DENIED);
        };

        let info = ServiceInstallInfo {
            name: name.to_string(),
            display_name: display_name.to_string(),
            binary_path: binary.to_path_buf(),
            arguments: vec![name.to_string()],
            service_type: Self::SERVICE_TYPE,
            start_type: StartType::Demand,
            error_control: ErrorControl::Normal,
        };

        match handle.create_service(&info) {
            Ok(()) => {
                tracing::info!(service = name, command_line = %info.command_line(), "service installed");
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, service = name, "failed to install service");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use crate::os_error::OsError;
    use crate::scm::memory::MemoryScm;
    use crate::status::{ErrorControl, StartType};

    use super::ServiceManager;

    #[test]
    fn install_passes_name_on_command_line() {
        let scm = MemoryScm::new();
        let manager = ServiceManager::new(&scm, false);
        manager.install("alpha", Path::new("C:/host/service-host.exe")).unwrap();

        let info = scm.registration("alpha").unwrap();
        assert_eq!(info.command_line(), "\"C:/host/service-host.exe\" alpha");
        assert_eq!(info.start_type, StartType::Demand);
        assert_eq!(info.error_control, ErrorControl::Normal);
    }

    #[test]
    fn missing_handle_is_not_fatal() {
        let scm = MemoryScm::new();
        scm.set_manager_available(false);

        let manager = ServiceManager::new(&scm, false);
        assert!(manager.handle().is_none());
        assert_eq!(manager.install("alpha", Path::new("/bin/host")), Err(OsError::ACCESS_DENIED));
    }

    #[test]
    fn query_only_cannot_install() {
        let scm = MemoryScm::new();
        let manager = ServiceManager::new(&scm, true);
        assert!(manager.handle().is_some());
        assert_eq!(manager.install("alpha", Path::new("/bin/host")), Err(OsError::ACCESS_DENIED));
    }
}
