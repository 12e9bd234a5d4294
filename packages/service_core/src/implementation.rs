//! The registrable, controllable unit and its state machine.
//!
//! States move `Stopped -> StartPending -> Running -> StopPending -> Stopped`.
//! Control requests arrive on the OS dispatch thread and are handled in
//! [`ServiceImplementation::control_handler`]; the lifecycle hooks either finish
//! a transition immediately or finish it later through [`ServiceState::set`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::handle::ServiceHandle;
use crate::manager::ServiceManager;
use crate::os_error::OsError;
use crate::scm::{ControlHandler, ScmBackend, StatusReporter};
use crate::status::{ControlResult, ServiceControl, ServiceStateKind, ServiceStatus};
use crate::sync::{Event, Mutex, WaitResult};

/// Result of a lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Finalize the transition now.
    Complete,
    /// The implementation calls [`ServiceState::set`] itself once done.
    InProgress,
}

/// Behavior plugged into a [`ServiceImplementation`].
pub trait ServiceLifecycle: Send + Sync + 'static {
    fn on_start(&self, state: &Arc<ServiceState>) -> HookOutcome {
        let _ = state;
        HookOutcome::Complete
    }

    fn on_stop(&self, state: &Arc<ServiceState>) -> HookOutcome {
        let _ = state;
        HookOutcome::Complete
    }

    /// Controls other than Stop. Rejected unless overridden.
    fn on_control(&self, control: ServiceControl, state: &Arc<ServiceState>) -> ControlResult {
        let _ = (control, state);
        ControlResult::NotImplemented
    }
}

/// Current state, accepted controls and the stop-wait event of one service.
///
/// The stop event is signaled exactly while the current state is `Stopped`.
pub struct ServiceState {
    name: String,
    status: Mutex<ServiceStatus>,
    reporter: Mutex<Option<Box<dyn StatusReporter>>>,
    stop_event: Event,
}

impl ServiceState {
    fn new(name: &str) -> Self {
        let stop_event = Event::new(true);
        /* initial state is Stopped */
        stop_event.set();

        ServiceState {
            name: name.to_string(),
            status: Mutex::new(ServiceStatus::default()),
            reporter: Mutex::new(None),
            stop_event,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> ServiceStateKind {
        self.status.wait().current_state
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.wait()
    }

    /// Safe to call from worker threads. The state, the reported status and
    /// the stop event change together under the status lock.
    pub fn set(&self, state: ServiceStateKind) {
        let mut status = self.status.wait();
        status.current_state = state;

        tracing::info!(service = %self.name, state = state.name(), "state set");
        self.report(&status);

        if state == ServiceStateKind::Stopped {
            self.stop_event.set();
        } else {
            self.stop_event.reset();
        }
    }

    /// Toggles whether Stop is accepted, independent of the current state.
    pub fn set_stoppable(&self, stoppable: bool) {
        let mut status = self.status.wait();
        status.controls_accepted.stop = stoppable;

        tracing::info!(service = %self.name, stoppable, "stoppable set");
        self.report(&status);
    }

    pub fn stoppable(&self) -> bool {
        let stoppable = self.status.wait().controls_accepted.stop;
        tracing::debug!(service = %self.name, stoppable, "stoppable");
        stoppable
    }

    pub fn wait_stopped(&self, timeout: Option<Duration>) -> WaitResult {
        self.stop_event.wait(timeout)
    }

    fn attach_reporter(&self, reporter: Box<dyn StatusReporter>) {
        *self.reporter.wait() = Some(reporter);
    }

    fn report(&self, status: &ServiceStatus) {
        let reporter = self.reporter.wait();
        let Some(reporter) = reporter.as_ref() else {
            return;
        };

        if let Err(error) = reporter.set_status(status) {
            tracing::error!(%error, service = %self.name, "failed to report service status");
        }
    }
}

pub struct ServiceImplementation {
    name: String,
    scm: Arc<dyn ScmBackend>,
    state: Arc<ServiceState>,
    lifecycle: Box<dyn ServiceLifecycle>,
}

impl ServiceImplementation {
    pub fn new(name: &str, scm: Arc<dyn ScmBackend>, lifecycle: impl ServiceLifecycle) -> Arc<Self> {
        Arc::new(ServiceImplementation {
            name: name.to_string(),
            scm,
            state: Arc::new(ServiceState::new(name)),
            lifecycle: Box::new(lifecycle),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn set_state(&self, state: ServiceStateKind) {
        self.state.set(state);
    }

    pub fn set_stoppable(&self, stoppable: bool) {
        self.state.set_stoppable(stoppable);
    }

    pub fn stoppable(&self) -> bool {
        self.state.stoppable()
    }

    /// Runs the service on the calling dispatch thread. Returns once the
    /// service reached `Stopped`.
    pub fn service_main(self: &Arc<Self>, args: Vec<String>) {
        tracing::debug!(service = %self.name, ?args, "service main");

        let this = self.clone();
        let handler: ControlHandler = Box::new(move |control| this.control_handler(control));

        let reporter = match self.scm.register_control_handler(&self.name, handler) {
            Ok(reporter) => reporter,
            Err(error) => {
                tracing::error!(%error, service = %self.name, "failed to register service control handler");
                return;
            }
        };
        self.state.attach_reporter(reporter);

        self.state.set(ServiceStateKind::StartPending);
        if self.lifecycle.on_start(&self.state) == HookOutcome::Complete {
            self.state.set(ServiceStateKind::Running);
        }

        if self.state.wait_stopped(None) != WaitResult::Signaled {
            tracing::error!(service = %self.name, "wait for stop failed");
        }

        tracing::info!(service = %self.name, "service main finished");
    }

    pub fn control_handler(&self, control: ServiceControl) -> ControlResult {
        tracing::info!(service = %self.name, %control, "control handler");

        match control {
            ServiceControl::Stop => {
                if !self.state.stoppable() {
                    return ControlResult::NotImplemented;
                }

                let current = self.state.current();
                if current != ServiceStateKind::Running {
                    tracing::info!(service = %self.name, state = %current, "got STOP while not running");
                    return ControlResult::NotImplemented;
                }

                self.state.set(ServiceStateKind::StopPending);
                if self.lifecycle.on_stop(&self.state) == HookOutcome::Complete {
                    self.state.set(ServiceStateKind::Stopped);
                }

                ControlResult::NoError
            }
            other => self.lifecycle.on_control(other, &self.state),
        }
    }

    pub fn binary_path() -> Result<std::path::PathBuf, OsError> {
        std::env::current_exe().map_err(OsError::from)
    }

    pub fn install(&self) -> Result<(), OsError> {
        let binary = Self::binary_path()?;
        self.install_with_binary(&binary)
    }

    pub fn install_with_binary(&self, binary: &Path) -> Result<(), OsError> {
        ServiceManager::new(self.scm.as_ref(), false).install(&self.name, binary)
    }

    pub fn installed(&self) -> bool {
        let mut service = ServiceHandle::open(self.scm.as_ref(), &self.name, true);
        service.query().is_ok()
    }

    pub fn uninstall(&self) -> Result<(), OsError> {
        ServiceHandle::open(self.scm.as_ref(), &self.name, false).delete()
    }

    pub fn control(&self, code: u8) {
        ServiceHandle::open(self.scm.as_ref(), &self.name, false).control(code);
    }
}
