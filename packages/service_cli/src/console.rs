//! Runs the configured services inside the console, driven by an in-memory
//! service control manager instead of the OS one.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use service_host_core::scm::ScmBackend;
use service_host_core::scm::memory::MemoryScm;
use service_host_core::status::NotifyMask;
use service_host_core::sync::{Event, WaitResult};
use service_host_core::{ServiceHandle, ServiceRegistry};

use crate::settings::HostSettings;
use crate::{CliError, build_registry};

const DISPATCHER_WAIT: Duration = Duration::from_secs(5);
const START_WAIT: Duration = Duration::from_secs(30);

pub struct ConsoleHost {
    scm: MemoryScm,
    registry: Arc<ServiceRegistry>,
    dispatcher: Option<JoinHandle<bool>>,
}

impl ConsoleHost {
    pub fn start(settings: &HostSettings) -> Result<Self, CliError> {
        let scm = MemoryScm::new();
        scm.set_session_id(0);

        let backend: Arc<dyn ScmBackend> = Arc::new(scm.clone());
        let registry = Arc::new(build_registry(settings, backend)?);

        for service in registry.iter() {
            service.install()?;
        }

        let dispatcher = {
            let registry = registry.clone();
            let scm = scm.clone();
            std::thread::Builder::new()
                .name("console-dispatcher".to_string())
                .spawn(move || registry.check_in_main(&scm))
                .map_err(CliError::IoError)?
        };

        let host = ConsoleHost {
            scm,
            registry,
            dispatcher: Some(dispatcher),
        };

        if !host.scm.wait_for_dispatcher(DISPATCHER_WAIT) {
            tracing::error!("console dispatcher did not start");
            return Ok(host);
        }

        for service in host.registry.iter() {
            host.start_service(service.service_name());
        }

        Ok(host)
    }

    fn start_service(&self, name: &str) {
        let running = Arc::new(Event::new(true));
        let mut handle = ServiceHandle::open(&self.scm, name, false);

        let notify = running.clone();
        if let Err(error) = handle.notify_status_change(NotifyMask::RUNNING, Box::new(move |_| notify.set())) {
            tracing::warn!(%error, service = name, "cannot watch for service start");
        }

        if handle.start().is_err() {
            return;
        }

        if running.wait(Some(START_WAIT)) != WaitResult::Signaled {
            tracing::warn!(service = name, "service did not reach running state");
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Stops every running service and waits for the dispatcher to finish.
    pub fn stop(mut self) -> bool {
        for service in self.registry.iter() {
            let mut handle = ServiceHandle::open(&self.scm, service.service_name(), false);
            if handle.needs_stop() {
                let _ = handle.stop();
            }
        }

        self.scm.shutdown_dispatcher();

        match self.dispatcher.take().map(|dispatcher| dispatcher.join()) {
            Some(Ok(finished)) => finished,
            Some(Err(_)) => {
                tracing::error!("console dispatcher panicked");
                false
            }
            None => false,
        }
    }
}

impl Drop for ConsoleHost {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            self.scm.shutdown_dispatcher();
        }
    }
}

/// Hosts the services until Ctrl+C.
pub fn run(settings: &HostSettings) -> Result<(), CliError> {
    let host = ConsoleHost::start(settings)?;
    println!("hosting {} service(s), press Ctrl+C to stop", host.registry().len());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::IoError)?;

    runtime.block_on(async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "cannot listen for ctrl_c");
        }
    });

    tracing::info!("received Ctrl+C signal");
    if !host.stop() {
        tracing::warn!("console dispatcher did not finish cleanly");
    }
    Ok(())
}
