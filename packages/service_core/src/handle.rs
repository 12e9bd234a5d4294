use crate::manager::ServiceManager;
use crate::os_error::OsError;
use crate::scm::{ScmBackend, ScmService};
use crate::status::{NotifyMask, ServiceControl, ServiceStateKind, ServiceStatus, StatusNotify};

/// Short lived handle to one named service registration.
///
/// Create it around a single operation and drop it afterwards. If the
/// registration cannot be opened every operation short circuits with
/// `ACCESS_DENIED` instead of failing hard.
pub struct ServiceHandle {
    name: String,
    /* dropped before the manager it was opened through */
    handle: Option<Box<dyn ScmService>>,
    status: Option<ServiceStatus>,
    _manager: ServiceManager,
}

impl ServiceHandle {
    pub fn open(scm: &dyn ScmBackend, name: &str, query_only: bool) -> Self {
        let manager = ServiceManager::new(scm, query_only);

        let handle = match manager.handle() {
            Some(manager) => match manager.open_service(name, query_only) {
                Ok(handle) => Some(handle),
                Err(error) => {
                    tracing::error!(%error, service = name, "failed to open service");
                    None
                }
            },
            None => {
                tracing::error!(service = name, "failed to open service, no service manager");
                None
            }
        };

        ServiceHandle {
            name: name.to_string(),
            handle,
            status: None,
            _manager: manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Status block cached by the last query or control.
    pub fn last_status(&self) -> Option<&ServiceStatus> {
        self.status.as_ref()
    }

    fn service(&self) -> Result<&dyn ScmService, OsError> {
        self.handle.as_deref().ok_or(OsError::ACCESS_DENIED)
    }

    pub fn start(&mut self) -> Result<(), OsError> {
        let service = self.service()?;

        if let Err(error) = service.start() {
            tracing::warn!(%error, service = %self.name, "start failed");
            return Err(error);
        }

        tracing::info!(service = %self.name, "start done");
        Ok(())
    }

    /// Sends Stop and caches the status the manager acknowledged with.
    pub fn stop(&mut self) -> Result<(), OsError> {
        let service = self.service()?;

        match service.control(ServiceControl::Stop) {
            Ok(status) => {
                self.status = Some(status);
                tracing::info!(service = %self.name, "stop done");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, service = %self.name, "stop failed");
                Err(error)
            }
        }
    }

    pub fn query(&mut self) -> Result<ServiceStateKind, OsError> {
        let status = self.service()?.query_status()?;
        self.status = Some(status);

        tracing::debug!(service = %self.name, state = %status.current_state, "query");
        Ok(status.current_state)
    }

    pub fn delete(&self) -> Result<(), OsError> {
        let service = self.service()?;

        match service.delete() {
            Ok(()) => {
                tracing::info!(service = %self.name, "delete OK");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, service = %self.name, "delete failed");
                Err(error)
            }
        }
    }

    pub fn needs_start(&mut self) -> bool {
        matches!(
            self.query(),
            Ok(ServiceStateKind::Stopped | ServiceStateKind::StopPending)
        )
    }

    pub fn needs_stop(&mut self) -> bool {
        matches!(self.query(), Ok(ServiceStateKind::Running))
    }

    /// Requests a one-shot notification once the service enters a state in `mask`.
    pub fn notify_status_change(&mut self, mask: NotifyMask, notify: StatusNotify) -> Result<(), OsError> {
        if self.handle.is_none() {
            return Err(OsError::INVALID_HANDLE);
        }

        if self.query().is_ok() {
            if let Some(status) = &self.status {
                if status.service_type.is_driver() {
                    tracing::warn!(service = %self.name, "status notification not possible for kernel drivers");
                    return Err(OsError::INVALID_FLAGS);
                }
            }
        }

        self.service()?.notify_status_change(mask, notify)
    }

    /// Sends a user defined control code. Failures are only logged.
    pub fn control(&self, code: u8) {
        if code < ServiceControl::USER_DEFINED_MIN {
            tracing::error!(service = %self.name, code, "control code outside the user defined range");
            return;
        }

        let Ok(service) = self.service() else {
            return;
        };

        if let Err(error) = service.control(ServiceControl::UserDefined(code)) {
            tracing::error!(%error, service = %self.name, code, "control failed");
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::manager::ServiceManager;
    use crate::os_error::OsError;
    use crate::scm::memory::MemoryScm;
    use crate::scm::{ScmBackend, ServiceInstallInfo};
    use crate::status::{
        ControlResult, ErrorControl, NotifyMask, ServiceControl, ServiceStateKind, ServiceType, StartType,
    };

    use super::ServiceHandle;

    fn installed(name: &str) -> MemoryScm {
        let scm = MemoryScm::new();
        ServiceManager::new(&scm, false).install(name, Path::new("/bin/host")).unwrap();
        scm
    }

    #[test]
    fn unopened_handle_short_circuits() {
        let scm = MemoryScm::new();
        let mut handle = ServiceHandle::open(&scm, "missing", false);

        assert!(!handle.is_open());
        assert_eq!(handle.start(), Err(OsError::ACCESS_DENIED));
        assert_eq!(handle.stop(), Err(OsError::ACCESS_DENIED));
        assert_eq!(handle.query(), Err(OsError::ACCESS_DENIED));
        assert_eq!(handle.delete(), Err(OsError::ACCESS_DENIED));
        assert!(!handle.needs_start());
        assert!(!handle.needs_stop());
        assert_eq!(
            handle.notify_status_change(NotifyMask::RUNNING, Box::new(|_| {})),
            Err(OsError::INVALID_HANDLE)
        );
        handle.control(130);
    }

    #[test]
    fn start_stop_drive_predicates() {
        let scm = installed("alpha");
        let mut handle = ServiceHandle::open(&scm, "alpha", false);

        assert!(handle.needs_start());
        assert!(!handle.needs_stop());

        handle.start().unwrap();
        assert_eq!(handle.query(), Ok(ServiceStateKind::Running));
        assert!(handle.needs_stop());
        assert!(!handle.needs_start());

        handle.stop().unwrap();
        assert_eq!(handle.last_status().unwrap().current_state, ServiceStateKind::Stopped);
    }

    #[test]
    fn query_only_handle_cannot_delete() {
        let scm = installed("alpha");
        let handle = ServiceHandle::open(&scm, "alpha", true);
        assert!(handle.is_open());
        assert_eq!(handle.delete(), Err(OsError::ACCESS_DENIED));
    }

    #[test]
    fn driver_rejects_status_notification() {
        let scm = MemoryScm::new();
        scm.open_manager(false)
            .unwrap()
            .create_service(&ServiceInstallInfo {
                name: "netkvm".to_string(),
                display_name: "netkvm".to_string(),
                binary_path: "/drivers/netkvm.sys".into(),
                arguments: vec![],
                service_type: ServiceType::KernelDriver,
                start_type: StartType::Demand,
                error_control: ErrorControl::Normal,
            })
            .unwrap();

        let mut handle = ServiceHandle::open(&scm, "netkvm", true);
        assert_eq!(
            handle.notify_status_change(NotifyMask::STOPPED, Box::new(|_| {})),
            Err(OsError::INVALID_FLAGS)
        );
    }

    #[test]
    fn control_only_sends_user_defined_codes() {
        let scm = installed("alpha");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let record = seen.clone();
        let _reporter = scm
            .register_control_handler(
                "alpha",
                Box::new(move |control| {
                    record.lock().unwrap().push(control);
                    ControlResult::NoError
                }),
            )
            .unwrap();

        let handle = ServiceHandle::open(&scm, "alpha", false);
        handle.control(5);
        handle.control(130);

        assert_eq!(*seen.lock().unwrap(), vec![ServiceControl::UserDefined(130)]);
    }

    #[test]
    fn status_notification_delivered() {
        let scm = installed("alpha");
        let fired = Arc::new(AtomicBool::new(false));

        let mut watcher = ServiceHandle::open(&scm, "alpha", true);
        let flag = fired.clone();
        watcher
            .notify_status_change(NotifyMask::RUNNING, Box::new(move |_| flag.store(true, Ordering::SeqCst)))
            .unwrap();

        ServiceHandle::open(&scm, "alpha", false).start().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
