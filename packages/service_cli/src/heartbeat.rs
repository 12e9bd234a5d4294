use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use service_host_core::status::{ControlResult, ServiceControl, ServiceStateKind};
use service_host_core::sync::Mutex;
use service_host_core::{HookOutcome, ServiceLifecycle, ServiceState};
use service_host_core::{ThreadControl, ThreadOwner, ThreadState, ThreadWorker};

/// User defined control that logs the current heartbeat count.
pub const HEARTBEAT_COUNT_CONTROL: u8 = 128;

const STOP_POLL: Duration = Duration::from_millis(50);

/// Sample payload: logs a heartbeat on a worker thread until stopped.
pub struct HeartbeatService {
    owner: ThreadOwner<Heartbeat>,
}

pub struct Heartbeat {
    service: String,
    interval: Duration,
    beats: AtomicU64,
    state: Mutex<Option<Arc<ServiceState>>>,
}

impl HeartbeatService {
    pub fn new(service: &str, interval: Duration) -> Self {
        HeartbeatService {
            owner: ThreadOwner::new(
                format!("heartbeat-{}", service),
                Heartbeat {
                    service: service.to_string(),
                    interval,
                    beats: AtomicU64::new(0),
                    state: Mutex::new(None),
                },
            ),
        }
    }

    pub fn beats(&self) -> u64 {
        self.owner.worker().beats.load(Ordering::SeqCst)
    }
}

impl ServiceLifecycle for HeartbeatService {
    fn on_start(&self, state: &Arc<ServiceState>) -> HookOutcome {
        *self.owner.worker().state.wait() = Some(state.clone());

        if !self.owner.start_thread() {
            tracing::error!(service = %state.name(), "heartbeat worker cannot start, previous worker still running");
            state.set(ServiceStateKind::Stopped);
            return HookOutcome::InProgress;
        }

        HookOutcome::Complete
    }

    fn on_stop(&self, state: &Arc<ServiceState>) -> HookOutcome {
        match self.owner.stop_thread(false) {
            ThreadState::Running => HookOutcome::InProgress,
            previous => {
                tracing::info!(service = %state.name(), ?previous, "heartbeat worker not running");
                if self.owner.is_thread_running() {
                    HookOutcome::InProgress
                } else {
                    HookOutcome::Complete
                }
            }
        }
    }

    fn on_control(&self, control: ServiceControl, state: &Arc<ServiceState>) -> ControlResult {
        match control {
            ServiceControl::UserDefined(HEARTBEAT_COUNT_CONTROL) => {
                tracing::info!(service = %state.name(), beats = self.beats(), "heartbeat count");
                ControlResult::NoError
            }
            _ => ControlResult::NotImplemented,
        }
    }
}

impl ThreadWorker for Heartbeat {
    fn thread_proc(&self, control: &ThreadControl) {
        tracing::info!(service = %self.service, interval = ?self.interval, "heartbeat worker started");

        let mut next = Instant::now() + self.interval;
        while control.should_run() {
            let now = Instant::now();
            if next <= now {
                let beats = self.beats.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(service = %self.service, beats, "heartbeat");
                next = now + self.interval;
            }

            std::thread::sleep(next.saturating_duration_since(now).min(STOP_POLL));
        }
    }

    fn thread_terminated(&self, previous: ThreadState) {
        tracing::info!(service = %self.service, ?previous, "heartbeat worker finished");

        if previous != ThreadState::Aborted {
            return;
        }

        let state = self.state.wait().clone();
        if let Some(state) = state {
            state.set(ServiceStateKind::Stopped);
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use service_host_core::scm::memory::MemoryScm;
    use service_host_core::status::{ControlResult, ServiceControl, ServiceStateKind};
    use service_host_core::sync::WaitResult;
    use service_host_core::{ServiceHandle, ServiceImplementation, ServiceRegistry};

    use super::{HEARTBEAT_COUNT_CONTROL, HeartbeatService};

    fn wait_for(state: ServiceStateKind, service: &ServiceImplementation) {
        for _ in 0..1000 {
            if service.state().current() == state {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("service never reached {:?}", state);
    }

    #[test]
    fn hosted_heartbeat_stops_from_worker() {
        let scm = MemoryScm::new();
        scm.set_session_id(0);

        let service = ServiceImplementation::new(
            "alpha",
            Arc::new(scm.clone()),
            HeartbeatService::new("alpha", Duration::from_millis(5)),
        );
        service.install_with_binary(Path::new("/opt/service-host")).unwrap();

        let mut registry = ServiceRegistry::new();
        registry.register(service.clone()).unwrap();
        let registry = Arc::new(registry);

        let dispatcher = {
            let registry = registry.clone();
            let scm = scm.clone();
            std::thread::spawn(move || registry.check_in_main(&scm))
        };
        assert!(scm.wait_for_dispatcher(Duration::from_secs(2)));

        ServiceHandle::open(&scm, "alpha", false).start().unwrap();
        wait_for(ServiceStateKind::Running, &service);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(
            scm.send_control("alpha", ServiceControl::UserDefined(HEARTBEAT_COUNT_CONTROL)),
            Ok(ControlResult::NoError)
        );
        assert_eq!(
            scm.send_control("alpha", ServiceControl::UserDefined(200)),
            Ok(ControlResult::NotImplemented)
        );

        assert_eq!(scm.send_control("alpha", ServiceControl::Stop), Ok(ControlResult::NoError));
        assert_eq!(service.state().wait_stopped(Some(Duration::from_secs(2))), WaitResult::Signaled);
        assert!(dispatcher.join().unwrap());
        assert_eq!(
            scm.reported_status("alpha").map(|s| s.current_state),
            Some(ServiceStateKind::Stopped)
        );
    }

    #[test]
    fn direct_stop_completes_through_worker() {
        let scm = MemoryScm::new();
        let heartbeat = HeartbeatService::new("beta", Duration::from_millis(2));
        let service = ServiceImplementation::new("beta", Arc::new(scm.clone()), heartbeat);

        let main = {
            let service = service.clone();
            std::thread::spawn(move || service.service_main(vec!["beta".to_string()]))
        };
        wait_for(ServiceStateKind::Running, &service);
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(service.control_handler(ServiceControl::Stop), ControlResult::NoError);
        main.join().unwrap();
        assert_eq!(service.state().current(), ServiceStateKind::Stopped);
    }

    #[test]
    fn second_start_while_worker_busy_reports_stopped() {
        let scm = MemoryScm::new();
        let service = ServiceImplementation::new(
            "gamma",
            Arc::new(scm.clone()),
            HeartbeatService::new("gamma", Duration::from_millis(5)),
        );

        let main = {
            let service = service.clone();
            std::thread::spawn(move || service.service_main(vec!["gamma".to_string()]))
        };
        wait_for(ServiceStateKind::Running, &service);

        /* worker of the first start is still alive */
        service.service_main(vec!["gamma".to_string()]);
        assert_eq!(service.state().current(), ServiceStateKind::Stopped);
        assert_eq!(
            scm.reported_status("gamma").map(|s| s.current_state),
            Some(ServiceStateKind::Stopped)
        );

        main.join().unwrap();
    }
}
