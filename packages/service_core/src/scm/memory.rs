//! In-process service control manager.
//!
//! Keeps registrations, control handlers and a dispatcher in memory so hosted
//! services can be driven without an OS service registry. Used by tests and by
//! the console host.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::os_error::OsError;
use crate::scm::{
    ControlHandler, DispatchTable, ScmBackend, ScmManager, ScmService, ServiceInstallInfo,
    StatusReporter,
};
use crate::status::{
    ControlResult, NotifyMask, ServiceControl, ServiceStateKind, ServiceStatus, StatusNotify,
};
use crate::sync::{Event, Mutex};

const DISPATCHER_POLL: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct MemoryScm {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changed: Event,
    session_id: AtomicU32,
    manager_available: AtomicBool,
    dispatcher_available: AtomicBool,
    handler_registration: AtomicBool,
}

#[derive(Default)]
struct State {
    services: HashMap<String, Registration>,
    handlers: HashMap<String, Arc<ControlHandler>>,
    reported: HashMap<String, ServiceStatus>,
    dispatcher: Option<Dispatcher>,
}

struct Registration {
    info: ServiceInstallInfo,
    status: ServiceStatus,
    marked_for_delete: bool,
    open_handles: usize,
    watchers: Vec<(NotifyMask, StatusNotify)>,
}

struct Dispatcher {
    table: DispatchTable,
    started: usize,
    running: usize,
    shutdown: bool,
    threads: Vec<JoinHandle<()>>,
}

type Fired = Vec<(StatusNotify, ServiceStatus)>;

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Default for MemoryScm {
    fn default() -> Self {
        MemoryScm {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Event::new(false),
                session_id: AtomicU32::new(1),
                manager_available: AtomicBool::new(true),
                dispatcher_available: AtomicBool::new(true),
                handler_registration: AtomicBool::new(true),
            }),
        }
    }
}

impl MemoryScm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session_id(&self, session: u32) {
        self.inner.session_id.store(session, Ordering::SeqCst);
    }

    pub fn set_manager_available(&self, available: bool) {
        self.inner.manager_available.store(available, Ordering::SeqCst);
    }

    pub fn set_dispatcher_available(&self, available: bool) {
        self.inner.dispatcher_available.store(available, Ordering::SeqCst);
    }

    pub fn set_handler_registration(&self, allowed: bool) {
        self.inner.handler_registration.store(allowed, Ordering::SeqCst);
    }

    pub fn registration(&self, name: &str) -> Option<ServiceInstallInfo> {
        let state = self.inner.state.wait();
        state.services.get(&key(name)).map(|reg| reg.info.clone())
    }

    pub fn is_marked_for_delete(&self, name: &str) -> bool {
        let state = self.inner.state.wait();
        state.services.get(&key(name)).map(|reg| reg.marked_for_delete).unwrap_or(false)
    }

    /// Last status a hosted service reported through its status reporter.
    pub fn reported_status(&self, name: &str) -> Option<ServiceStatus> {
        let state = self.inner.state.wait();
        state.reported.get(&key(name)).copied()
    }

    pub fn has_control_handler(&self, name: &str) -> bool {
        let state = self.inner.state.wait();
        state.handlers.contains_key(&key(name))
    }

    /// Delivers `control` straight to the handler registered under `name`.
    pub fn send_control(&self, name: &str, control: ServiceControl) -> Result<ControlResult, OsError> {
        let handler = {
            let state = self.inner.state.wait();
            state.handlers.get(&key(name)).cloned()
        };

        match handler {
            Some(handler) => Ok(handler(control)),
            None => Err(OsError::SERVICE_NOT_ACTIVE),
        }
    }

    pub fn is_dispatching(&self) -> bool {
        self.inner.state.wait().dispatcher.is_some()
    }

    pub fn wait_for_dispatcher(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_dispatching() {
                return true;
            }
            if deadline <= Instant::now() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Makes a blocked [`ScmBackend::run_dispatcher`] return once running entries finish.
    pub fn shutdown_dispatcher(&self) {
        {
            let mut state = self.inner.state.wait();
            if let Some(dispatcher) = state.dispatcher.as_mut() {
                dispatcher.shutdown = true;
            }
        }
        self.inner.changed.set();
    }
}

impl Inner {
    fn update_status(state: &mut State, key: &str, status: ServiceStatus) -> Fired {
        let Some(reg) = state.services.get_mut(key) else {
            return Vec::new();
        };

        reg.status = status;

        let mut fired = Vec::new();
        let mut remaining = Vec::new();
        for (mask, notify) in reg.watchers.drain(..) {
            if mask.contains_state(status.current_state) {
                fired.push((notify, status));
            } else {
                remaining.push((mask, notify));
            }
        }
        reg.watchers = remaining;

        fired
    }

    fn fire(fired: Fired) {
        for (notify, status) in fired {
            notify(status);
        }
    }
}

impl ScmBackend for MemoryScm {
    fn open_manager(&self, query_only: bool) -> Result<Box<dyn ScmManager>, OsError> {
        if !self.inner.manager_available.load(Ordering::SeqCst) {
            return Err(OsError::ACCESS_DENIED);
        }

        Ok(Box::new(MemoryManager {
            inner: self.inner.clone(),
            query_only,
        }))
    }

    fn register_control_handler(
        &self,
        name: &str,
        handler: ControlHandler,
    ) -> Result<Box<dyn StatusReporter>, OsError> {
        if !self.inner.handler_registration.load(Ordering::SeqCst) {
            return Err(OsError::SERVICE_DOES_NOT_EXIST);
        }

        let mut state = self.inner.state.wait();
        state.handlers.insert(key(name), Arc::new(handler));

        Ok(Box::new(MemoryReporter {
            inner: self.inner.clone(),
            key: key(name),
        }))
    }

    fn run_dispatcher(&self, table: DispatchTable) -> Result<(), OsError> {
        if !self.inner.dispatcher_available.load(Ordering::SeqCst) {
            return Err(OsError::FAILED_SERVICE_CONTROLLER_CONNECT);
        }

        {
            let mut state = self.inner.state.wait();
            if state.dispatcher.is_some() {
                return Err(OsError::SERVICE_ALREADY_RUNNING);
            }

            state.dispatcher = Some(Dispatcher {
                table,
                started: 0,
                running: 0,
                shutdown: false,
                threads: Vec::new(),
            });
        }

        tracing::debug!("memory dispatcher started");

        let threads = loop {
            {
                let mut state = self.inner.state.wait();
                let finished = match state.dispatcher.as_ref() {
                    Some(d) => d.running == 0 && (d.shutdown || d.started > 0),
                    None => true,
                };

                if finished {
                    break state.dispatcher.take().map(|d| d.threads).unwrap_or_default();
                }
            }

            self.inner.changed.wait(Some(DISPATCHER_POLL));
        };

        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("hosted service entry panicked");
            }
        }

        tracing::debug!("memory dispatcher finished");
        Ok(())
    }

    fn current_session_id(&self) -> Result<u32, OsError> {
        Ok(self.inner.session_id.load(Ordering::SeqCst))
    }
}

struct MemoryManager {
    inner: Arc<Inner>,
    query_only: bool,
}

impl ScmManager for MemoryManager {
    fn create_service(&self, info: &ServiceInstallInfo) -> Result<(), OsError> {
        if self.query_only {
            return Err(OsError::ACCESS_DENIED);
        }

        let mut state = self.inner.state.wait();
        let key = key(&info.name);
        if state.services.contains_key(&key) {
            return Err(OsError::SERVICE_EXISTS);
        }

        let status = ServiceStatus {
            service_type: info.service_type,
            ..ServiceStatus::default()
        };

        state.services.insert(
            key,
            Registration {
                info: info.clone(),
                status,
                marked_for_delete: false,
                open_handles: 0,
                watchers: Vec::new(),
            },
        );

        Ok(())
    }

    fn open_service(&self, name: &str, query_only: bool) -> Result<Box<dyn ScmService>, OsError> {
        let mut state = self.inner.state.wait();
        let key = key(name);

        let Some(reg) = state.services.get_mut(&key) else {
            return Err(OsError::SERVICE_DOES_NOT_EXIST);
        };
        if reg.marked_for_delete {
            return Err(OsError::SERVICE_MARKED_FOR_DELETE);
        }
        reg.open_handles += 1;

        Ok(Box::new(MemoryService {
            inner: self.inner.clone(),
            name: reg.info.name.clone(),
            key,
            query_only,
        }))
    }
}

struct MemoryService {
    inner: Arc<Inner>,
    name: String,
    key: String,
    query_only: bool,
}

impl MemoryService {
    fn require_control(&self) -> Result<(), OsError> {
        if self.query_only {
            return Err(OsError::ACCESS_DENIED);
        }
        Ok(())
    }

    fn spawn_entry(&self, dispatcher: &mut Dispatcher) -> Result<(), OsError> {
        let entry = dispatcher.table.entry.clone();
        let inner = self.inner.clone();
        let args = vec![self.name.clone()];

        let thread = std::thread::Builder::new()
            .name(format!("service-main-{}", self.key))
            .spawn(move || {
                entry(args);

                {
                    let mut state = inner.state.wait();
                    if let Some(dispatcher) = state.dispatcher.as_mut() {
                        dispatcher.running -= 1;
                    }
                }
                inner.changed.set();
            })?;

        dispatcher.started += 1;
        dispatcher.running += 1;
        dispatcher.threads.push(thread);
        Ok(())
    }
}

impl ScmService for MemoryService {
    fn start(&self) -> Result<(), OsError> {
        self.require_control()?;

        let fired = {
            let mut guard = self.inner.state.wait();
            let state = &mut *guard;

            let Some(reg) = state.services.get(&self.key) else {
                return Err(OsError::SERVICE_DOES_NOT_EXIST);
            };
            if reg.status.current_state != ServiceStateKind::Stopped {
                return Err(OsError::SERVICE_ALREADY_RUNNING);
            }
            let mut status = reg.status;

            match state.dispatcher.as_mut() {
                Some(dispatcher) if dispatcher.table.contains(&self.name) => {
                    self.spawn_entry(dispatcher)?;
                    status.current_state = ServiceStateKind::StartPending;
                }
                _ => {
                    status.current_state = ServiceStateKind::Running;
                }
            }

            Inner::update_status(state, &self.key, status)
        };

        Inner::fire(fired);
        Ok(())
    }

    fn control(&self, control: ServiceControl) -> Result<ServiceStatus, OsError> {
        self.require_control()?;

        let handler = {
            let state = self.inner.state.wait();
            state.handlers.get(&self.key).cloned()
        };

        if let Some(handler) = handler {
            return match handler(control) {
                ControlResult::NoError => self.query_status(),
                ControlResult::NotImplemented => Err(OsError::CALL_NOT_IMPLEMENTED),
            };
        }

        let fired = {
            let mut state = self.inner.state.wait();
            let Some(reg) = state.services.get(&self.key) else {
                return Err(OsError::SERVICE_DOES_NOT_EXIST);
            };
            if reg.status.current_state == ServiceStateKind::Stopped {
                return Err(OsError::SERVICE_NOT_ACTIVE);
            }
            if control != ServiceControl::Stop {
                return Err(OsError::INVALID_SERVICE_CONTROL);
            }

            let mut status = reg.status;
            status.current_state = ServiceStateKind::Stopped;
            Inner::update_status(&mut state, &self.key, status)
        };

        Inner::fire(fired);
        self.query_status()
    }

    fn query_status(&self) -> Result<ServiceStatus, OsError> {
        let state = self.inner.state.wait();
        state
            .services
            .get(&self.key)
            .map(|reg| reg.status)
            .ok_or(OsError::SERVICE_DOES_NOT_EXIST)
    }

    fn delete(&self) -> Result<(), OsError> {
        self.require_control()?;

        let mut state = self.inner.state.wait();
        let Some(reg) = state.services.get_mut(&self.key) else {
            return Err(OsError::SERVICE_DOES_NOT_EXIST);
        };
        if reg.marked_for_delete {
            return Err(OsError::SERVICE_MARKED_FOR_DELETE);
        }

        reg.marked_for_delete = true;
        Ok(())
    }

    fn notify_status_change(&self, mask: NotifyMask, notify: StatusNotify) -> Result<(), OsError> {
        if mask.is_empty() {
            return Err(OsError::INVALID_PARAMETER);
        }

        let ready = {
            let mut state = self.inner.state.wait();
            let Some(reg) = state.services.get_mut(&self.key) else {
                return Err(OsError::SERVICE_DOES_NOT_EXIST);
            };

            if mask.contains_state(reg.status.current_state) {
                Some((notify, reg.status))
            } else {
                reg.watchers.push((mask, notify));
                None
            }
        };

        if let Some((notify, status)) = ready {
            notify(status);
        }
        Ok(())
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        let mut state = self.inner.state.wait();

        let remove = match state.services.get_mut(&self.key) {
            Some(reg) => {
                reg.open_handles = reg.open_handles.saturating_sub(1);
                reg.marked_for_delete && reg.open_handles == 0
            }
            None => false,
        };

        if remove {
            state.services.remove(&self.key);
            tracing::debug!(service = %self.name, "registration removed");
        }
    }
}

struct MemoryReporter {
    inner: Arc<Inner>,
    key: String,
}

impl StatusReporter for MemoryReporter {
    fn set_status(&self, status: &ServiceStatus) -> Result<(), OsError> {
        let (fired, _removed) = {
            let mut state = self.inner.state.wait();
            state.reported.insert(self.key.clone(), *status);

            /* dropped after the lock is released */
            let removed = if status.current_state == ServiceStateKind::Stopped {
                state.handlers.remove(&self.key)
            } else {
                None
            };

            (Inner::update_status(&mut state, &self.key, *status), removed)
        };

        Inner::fire(fired);
        self.inner.changed.set();
        Ok(())
    }
}
