//! Windows service control manager backend.

use std::ffi::{OsStr, OsString};
use std::sync::OnceLock;
use std::time::Duration;

use windows_service::service::{
    ServiceAccess, ServiceControlAccept, ServiceErrorControl, ServiceExitCode, ServiceInfo,
    ServiceStartType, ServiceState as WinServiceState, ServiceStatus as WinServiceStatus,
    ServiceType as WinServiceType, UserEventCode,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use windows_sys::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows_sys::Win32::System::Services::{SERVICE_TABLE_ENTRYW, StartServiceCtrlDispatcherW};
use windows_sys::Win32::System::Threading::GetCurrentProcessId;
use windows_sys::core::PWSTR;

use crate::os_error::OsError;
use crate::scm::{
    ControlHandler, DispatchTable, ScmBackend, ScmManager, ScmService, ServiceEntry,
    ServiceInstallInfo, StatusReporter,
};
use crate::status::{
    ControlResult, ControlsAccepted, ErrorControl, NotifyMask, ServiceControl, ServiceStateKind,
    ServiceStatus, ServiceType, StartType, StatusNotify,
};

const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(250);

static DISPATCH_ENTRY: OnceLock<ServiceEntry> = OnceLock::new();

#[derive(Default)]
pub struct WindowsScm;

fn os_error(error: windows_service::Error) -> OsError {
    match error {
        windows_service::Error::Winapi(error) => OsError::from(error),
        other => {
            tracing::warn!(error = %other, "service call rejected before reaching the OS");
            OsError::INVALID_PARAMETER
        }
    }
}

fn connect(query_only: bool) -> Result<ServiceManager, OsError> {
    let access = if query_only {
        ServiceManagerAccess::CONNECT | ServiceManagerAccess::ENUMERATE_SERVICE
    } else {
        ServiceManagerAccess::CONNECT
            | ServiceManagerAccess::CREATE_SERVICE
            | ServiceManagerAccess::ENUMERATE_SERVICE
    };

    ServiceManager::local_computer(None::<&str>, access).map_err(os_error)
}

fn service_access(query_only: bool) -> ServiceAccess {
    if query_only {
        ServiceAccess::QUERY_STATUS
    } else {
        ServiceAccess::all()
    }
}

fn to_win_status(status: &ServiceStatus) -> WinServiceStatus {
    let current_state = match status.current_state {
        ServiceStateKind::StartPending => WinServiceState::StartPending,
        ServiceStateKind::StopPending => WinServiceState::StopPending,
        ServiceStateKind::Running => WinServiceState::Running,
        ServiceStateKind::ContinuePending => WinServiceState::ContinuePending,
        ServiceStateKind::PausePending => WinServiceState::PausePending,
        ServiceStateKind::Paused => WinServiceState::Paused,
        ServiceStateKind::Stopped | ServiceStateKind::Unknown => WinServiceState::Stopped,
    };

    let mut controls_accepted = ServiceControlAccept::empty();
    if status.controls_accepted.stop {
        controls_accepted |= ServiceControlAccept::STOP;
    }
    if status.controls_accepted.session_change {
        controls_accepted |= ServiceControlAccept::SESSION_CHANGE;
    }

    let exit_code = if status.service_specific_exit_code != 0 {
        ServiceExitCode::ServiceSpecific(status.service_specific_exit_code)
    } else {
        ServiceExitCode::Win32(status.exit_code)
    };

    WinServiceStatus {
        service_type: to_win_type(status.service_type),
        current_state,
        controls_accepted,
        exit_code,
        checkpoint: status.checkpoint,
        wait_hint: status.wait_hint,
        process_id: None,
    }
}

fn from_win_status(status: &WinServiceStatus) -> ServiceStatus {
    let service_type = if status.service_type.contains(WinServiceType::KERNEL_DRIVER) {
        ServiceType::KernelDriver
    } else if status.service_type.contains(WinServiceType::FILE_SYSTEM_DRIVER) {
        ServiceType::FileSystemDriver
    } else if status.service_type.contains(WinServiceType::SHARE_PROCESS) {
        ServiceType::ShareProcess
    } else {
        ServiceType::OwnProcess
    };

    let (exit_code, service_specific_exit_code) = match status.exit_code {
        ServiceExitCode::Win32(code) => (code, 0),
        ServiceExitCode::ServiceSpecific(code) => (0, code),
    };

    ServiceStatus {
        service_type,
        current_state: ServiceStateKind::from_raw(status.current_state as u32),
        controls_accepted: ControlsAccepted {
            stop: status.controls_accepted.contains(ServiceControlAccept::STOP),
            session_change: status.controls_accepted.contains(ServiceControlAccept::SESSION_CHANGE),
        },
        exit_code,
        service_specific_exit_code,
        checkpoint: status.checkpoint,
        wait_hint: status.wait_hint,
    }
}

fn to_win_type(service_type: ServiceType) -> WinServiceType {
    match service_type {
        ServiceType::OwnProcess => WinServiceType::OWN_PROCESS,
        ServiceType::ShareProcess => WinServiceType::SHARE_PROCESS,
        ServiceType::KernelDriver => WinServiceType::KERNEL_DRIVER,
        ServiceType::FileSystemDriver => WinServiceType::FILE_SYSTEM_DRIVER,
    }
}

impl ScmBackend for WindowsScm {
    fn open_manager(&self, query_only: bool) -> Result<Box<dyn ScmManager>, OsError> {
        let manager = connect(query_only)?;
        Ok(Box::new(WindowsManager { manager }))
    }

    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> Result<Box<dyn StatusReporter>, OsError> {
        let event_handler = move |event: windows_service::service::ServiceControl| {
            let control = ServiceControl::from_raw(event.raw_service_control_type());
            match handler(control) {
                ControlResult::NoError => ServiceControlHandlerResult::NoError,
                ControlResult::NotImplemented => ServiceControlHandlerResult::NotImplemented,
            }
        };

        let handle = service_control_handler::register(name, event_handler).map_err(os_error)?;
        Ok(Box::new(WindowsReporter { handle }))
    }

    fn run_dispatcher(&self, table: DispatchTable) -> Result<(), OsError> {
        if DISPATCH_ENTRY.set(table.entry).is_err() {
            return Err(OsError::SERVICE_ALREADY_RUNNING);
        }

        let mut names: Vec<Vec<u16>> = table
            .names
            .iter()
            .map(|name| name.encode_utf16().chain(std::iter::once(0)).collect())
            .collect();

        let mut entries: Vec<SERVICE_TABLE_ENTRYW> = names
            .iter_mut()
            .map(|name| SERVICE_TABLE_ENTRYW {
                lpServiceName: name.as_mut_ptr(),
                lpServiceProc: Some(service_main),
            })
            .collect();

        entries.push(SERVICE_TABLE_ENTRYW {
            lpServiceName: std::ptr::null_mut(),
            lpServiceProc: None,
        });

        // SAFETY: `entries` is null terminated and every name buffer outlives the call.
        let ok = unsafe { StartServiceCtrlDispatcherW(entries.as_ptr()) };
        if ok == 0 {
            return Err(OsError::from(std::io::Error::last_os_error()));
        }

        Ok(())
    }

    fn current_session_id(&self) -> Result<u32, OsError> {
        let mut session = 0u32;

        // SAFETY: `session` is a valid out pointer for the duration of the call.
        let ok = unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) };
        if ok == 0 {
            return Err(OsError::from(std::io::Error::last_os_error()));
        }

        Ok(session)
    }
}

unsafe extern "system" fn service_main(argc: u32, argv: *mut PWSTR) {
    // SAFETY: the dispatcher passes `argc` valid null terminated wide strings.
    let args = unsafe { parse_arguments(argc, argv) };

    match DISPATCH_ENTRY.get() {
        Some(entry) => entry(args),
        None => tracing::error!("service started without a dispatch entry"),
    }
}

unsafe fn parse_arguments(argc: u32, argv: *mut PWSTR) -> Vec<String> {
    (0..argc as usize)
        .map(|i| {
            let ptr = unsafe { *argv.add(i) };
            let mut len = 0usize;
            while unsafe { *ptr.add(len) } != 0 {
                len += 1;
            }
            let wide = unsafe { std::slice::from_raw_parts(ptr, len) };
            String::from_utf16_lossy(wide)
        })
        .collect()
}

struct WindowsManager {
    manager: ServiceManager,
}

// SAFETY: SC_HANDLEs may be used from any thread.
unsafe impl Send for WindowsManager {}

impl ScmManager for WindowsManager {
    fn create_service(&self, info: &ServiceInstallInfo) -> Result<(), OsError> {
        let service_info = ServiceInfo {
            name: OsString::from(&info.name),
            display_name: OsString::from(&info.display_name),
            service_type: to_win_type(info.service_type),
            start_type: match info.start_type {
                StartType::Auto => ServiceStartType::AutoStart,
                StartType::Demand => ServiceStartType::OnDemand,
                StartType::Disabled => ServiceStartType::Disabled,
            },
            error_control: match info.error_control {
                ErrorControl::Ignore => ServiceErrorControl::Ignore,
                ErrorControl::Normal => ServiceErrorControl::Normal,
                ErrorControl::Severe => ServiceErrorControl::Severe,
                ErrorControl::Critical => ServiceErrorControl::Critical,
            },
            executable_path: info.binary_path.clone(),
            launch_arguments: info.arguments.iter().map(OsString::from).collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };

        let access = ServiceAccess::QUERY_STATUS | ServiceAccess::START | ServiceAccess::STOP;
        self.manager
            .create_service(&service_info, access)
            .map(|_| ())
            .map_err(os_error)
    }

    fn open_service(&self, name: &str, query_only: bool) -> Result<Box<dyn ScmService>, OsError> {
        let service = self
            .manager
            .open_service(name, service_access(query_only))
            .map_err(os_error)?;

        Ok(Box::new(WindowsService {
            name: name.to_string(),
            service,
        }))
    }
}

struct WindowsService {
    name: String,
    service: windows_service::service::Service,
}

// SAFETY: SC_HANDLEs may be used from any thread.
unsafe impl Send for WindowsService {}

impl ScmService for WindowsService {
    fn start(&self) -> Result<(), OsError> {
        self.service.start::<&OsStr>(&[]).map_err(os_error)
    }

    fn control(&self, control: ServiceControl) -> Result<ServiceStatus, OsError> {
        let status = match control {
            ServiceControl::Stop => self.service.stop(),
            ServiceControl::Pause => self.service.pause(),
            ServiceControl::Continue => self.service.resume(),
            ServiceControl::UserDefined(code) => {
                let code = UserEventCode::from_raw(code as u32).map_err(os_error)?;
                self.service.notify(code)
            }
            _ => return Err(OsError::INVALID_SERVICE_CONTROL),
        };

        status.map(|status| from_win_status(&status)).map_err(os_error)
    }

    fn query_status(&self) -> Result<ServiceStatus, OsError> {
        self.service
            .query_status()
            .map(|status| from_win_status(&status))
            .map_err(os_error)
    }

    fn delete(&self) -> Result<(), OsError> {
        self.service.delete().map_err(os_error)
    }

    fn notify_status_change(&self, mask: NotifyMask, notify: StatusNotify) -> Result<(), OsError> {
        if mask.is_empty() {
            return Err(OsError::INVALID_PARAMETER);
        }

        let name = self.name.clone();
        std::thread::Builder::new()
            .name(format!("notify-{}", name))
            .spawn(move || {
                let service = match connect(true).and_then(|manager| {
                    manager
                        .open_service(&name, ServiceAccess::QUERY_STATUS)
                        .map_err(os_error)
                }) {
                    Ok(service) => service,
                    Err(error) => {
                        tracing::error!(%error, service = %name, "cannot watch service status");
                        return;
                    }
                };

                loop {
                    match service.query_status() {
                        Ok(status) => {
                            let status = from_win_status(&status);
                            if mask.contains_state(status.current_state) {
                                notify(status);
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::error!(error = %os_error(error), service = %name, "status watch ended");
                            return;
                        }
                    }
                    std::thread::sleep(NOTIFY_POLL_INTERVAL);
                }
            })?;

        Ok(())
    }
}

struct WindowsReporter {
    handle: ServiceStatusHandle,
}

// SAFETY: the status handle is process wide and not tied to a thread.
unsafe impl Send for WindowsReporter {}
unsafe impl Sync for WindowsReporter {}

impl StatusReporter for WindowsReporter {
    fn set_status(&self, status: &ServiceStatus) -> Result<(), OsError> {
        self.handle
            .set_service_status(to_win_status(status))
            .map_err(os_error)
    }
}
