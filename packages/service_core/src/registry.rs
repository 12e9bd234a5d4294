use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::implementation::ServiceImplementation;
use crate::scm::{DispatchTable, ScmBackend, ServiceEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => write!(f, "service {} is already registered", name),
        }
    }
}

impl Error for RegistryError {}

/// Services hosted by this process, looked up by case-insensitive name.
///
/// Built once at process start and handed to [`ServiceRegistry::check_in_main`].
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceImplementation>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<ServiceImplementation>) -> Result<(), RegistryError> {
        if self.find(service.service_name()).is_some() {
            return Err(RegistryError::DuplicateName(service.service_name().to_string()));
        }

        tracing::debug!(service = service.service_name(), "service registered");
        self.services.push(service);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceImplementation>> {
        self.services.iter()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<ServiceImplementation>> {
        self.services
            .iter()
            .find(|service| service.service_name().eq_ignore_ascii_case(name))
    }

    /// Picks the service an OS entry call is meant for. A process hosting a
    /// single service runs it whatever name the OS passed.
    pub fn resolve(&self, args: &[String]) -> Option<&Arc<ServiceImplementation>> {
        match args.first() {
            Some(name) if self.services.len() != 1 => self.find(name),
            _ => self.services.first(),
        }
    }

    /// Hands the calling thread to the OS service dispatcher when the process
    /// runs in the service session (session 0) and hosts at least one service.
    ///
    /// Returns true once the dispatch loop completed and the process should
    /// exit; false means the process continues its interactive startup.
    pub fn check_in_main(self: &Arc<Self>, scm: &dyn ScmBackend) -> bool {
        let session = match scm.current_session_id() {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(%error, "cannot query session id");
                return false;
            }
        };

        tracing::info!("the application runs in session {}", session);

        if session != 0 || self.is_empty() {
            return false;
        }

        let registry = self.clone();
        let entry: ServiceEntry = Arc::new(move |args: Vec<String>| match registry.resolve(&args) {
            Some(service) => service.service_main(args),
            None => tracing::error!("nothing found to run: {} args", args.len()),
        });

        let table = DispatchTable {
            names: self.services.iter().map(|s| s.service_name().to_string()).collect(),
            entry,
        };

        match scm.run_dispatcher(table) {
            Ok(()) => {
                tracing::info!("service dispatcher finished");
                true
            }
            Err(error) => {
                tracing::error!(%error, "service dispatcher failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::handle::ServiceHandle;
    use crate::implementation::{HookOutcome, ServiceImplementation, ServiceLifecycle, ServiceState};
    use crate::scm::memory::MemoryScm;
    use crate::status::{ControlResult, ServiceControl, ServiceStateKind};

    use super::{RegistryError, ServiceRegistry};

    #[derive(Default, Clone)]
    struct Observed {
        starts: Arc<AtomicUsize>,
        controls: Arc<AtomicUsize>,
    }

    impl ServiceLifecycle for Observed {
        fn on_start(&self, _state: &Arc<ServiceState>) -> HookOutcome {
            self.starts.fetch_add(1, Ordering::SeqCst);
            HookOutcome::Complete
        }

        fn on_control(&self, _control: ServiceControl, _state: &Arc<ServiceState>) -> ControlResult {
            self.controls.fetch_add(1, Ordering::SeqCst);
            ControlResult::NoError
        }
    }

    fn service(scm: &MemoryScm, name: &str, observed: &Observed) -> Arc<ServiceImplementation> {
        ServiceImplementation::new(name, Arc::new(scm.clone()), observed.clone())
    }

    fn wait_for(state: ServiceStateKind, service: &ServiceImplementation) {
        for _ in 0..1000 {
            if service.state().current() == state {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("{} never reached {:?}", service.service_name(), state);
    }

    #[test]
    fn names_are_unique_ignoring_case() {
        let scm = MemoryScm::new();
        let observed = Observed::default();
        let mut registry = ServiceRegistry::new();

        registry.register(service(&scm, "alpha", &observed)).unwrap();
        assert_eq!(
            registry.register(service(&scm, "ALPHA", &observed)),
            Err(RegistryError::DuplicateName("ALPHA".to_string()))
        );
        assert!(registry.find("Alpha").is_some());
    }

    #[test]
    fn single_service_resolves_any_name() {
        let scm = MemoryScm::new();
        let mut registry = ServiceRegistry::new();
        registry.register(service(&scm, "alpha", &Observed::default())).unwrap();

        let resolved = registry.resolve(&["something-else".to_string()]).unwrap();
        assert_eq!(resolved.service_name(), "alpha");
        assert_eq!(registry.resolve(&[]).unwrap().service_name(), "alpha");
    }

    #[test]
    fn multiple_services_resolve_by_name() {
        let scm = MemoryScm::new();
        let mut registry = ServiceRegistry::new();
        registry.register(service(&scm, "alpha", &Observed::default())).unwrap();
        registry.register(service(&scm, "beta", &Observed::default())).unwrap();

        assert_eq!(registry.resolve(&["BETA".to_string()]).unwrap().service_name(), "beta");
        assert!(registry.resolve(&["gamma".to_string()]).is_none());
        assert_eq!(registry.resolve(&[]).unwrap().service_name(), "alpha");
    }

    #[test]
    fn interactive_session_skips_dispatch() {
        let scm = MemoryScm::new();
        scm.set_session_id(1);

        let mut registry = ServiceRegistry::new();
        registry.register(service(&scm, "alpha", &Observed::default())).unwrap();

        assert!(!Arc::new(registry).check_in_main(&scm));
        assert!(!scm.is_dispatching());
    }

    #[test]
    fn empty_registry_skips_dispatch() {
        let scm = MemoryScm::new();
        scm.set_session_id(0);
        assert!(!Arc::new(ServiceRegistry::new()).check_in_main(&scm));
    }

    #[test]
    fn refused_dispatcher_continues_interactively() {
        let scm = MemoryScm::new();
        scm.set_session_id(0);
        scm.set_dispatcher_available(false);

        let mut registry = ServiceRegistry::new();
        registry.register(service(&scm, "alpha", &Observed::default())).unwrap();

        assert!(!Arc::new(registry).check_in_main(&scm));
    }

    #[test]
    fn dispatch_routes_to_named_service() {
        let scm = MemoryScm::new();
        scm.set_session_id(0);

        let alpha_seen = Observed::default();
        let beta_seen = Observed::default();

        let alpha = service(&scm, "alpha", &alpha_seen);
        let beta = service(&scm, "beta", &beta_seen);
        alpha.install_with_binary(Path::new("/opt/host")).unwrap();
        beta.install_with_binary(Path::new("/opt/host")).unwrap();

        let mut registry = ServiceRegistry::new();
        registry.register(alpha.clone()).unwrap();
        registry.register(beta.clone()).unwrap();
        let registry = Arc::new(registry);

        let dispatcher = {
            let registry = registry.clone();
            let scm = scm.clone();
            std::thread::spawn(move || registry.check_in_main(&scm))
        };
        assert!(scm.wait_for_dispatcher(Duration::from_secs(2)));

        ServiceHandle::open(&scm, "beta", false).start().unwrap();
        wait_for(ServiceStateKind::Running, &beta);

        ServiceHandle::open(&scm, "beta", false).control(140);
        assert_eq!(beta_seen.controls.load(Ordering::SeqCst), 1);

        ServiceHandle::open(&scm, "beta", false).stop().unwrap();
        assert!(dispatcher.join().unwrap());

        assert_eq!(beta_seen.starts.load(Ordering::SeqCst), 1);
        assert_eq!(beta.state().current(), ServiceStateKind::Stopped);
        assert_eq!(alpha_seen.starts.load(Ordering::SeqCst), 0);
        assert_eq!(alpha_seen.controls.load(Ordering::SeqCst), 0);
        assert_eq!(alpha.state().current(), ServiceStateKind::Stopped);
    }
}
