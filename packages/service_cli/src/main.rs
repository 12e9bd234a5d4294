use std::fmt::{Display, Formatter};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use service_host_core::scm::{self, ScmBackend};
use service_host_core::{
    OsError, RegistryError, ServiceHandle, ServiceImplementation, ServiceManager, ServiceRegistry,
};

use crate::cli::{Cli, CliCommand};
use crate::heartbeat::HeartbeatService;
use crate::logging::LogTarget;
use crate::settings::{HostSettings, LoadSettingsError};

pub mod cli;
pub mod console;
pub mod heartbeat;
pub mod logging;
pub mod settings;

fn main() -> Result<ExitCode, CliError> {
    let native = scm::native();

    /* launched by the OS service manager, hand the main thread to its dispatcher */
    let mut hosted_log = None;
    if let Ok(scm) = &native {
        if scm.current_session_id().ok() == Some(0) {
            let (finished, log) = check_in(scm.clone())?;
            if finished {
                return Ok(ExitCode::SUCCESS);
            }
            hosted_log = Some(log);
        }
    }

    let cli = Cli::parse();
    let (settings, settings_path) = HostSettings::load(cli.settings_path.clone())?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        settings.log_level.clone().unwrap_or_else(|| "info".to_string())
    };
    let hosted_path = hosted_log.as_ref().map(|log| log.path.as_str());
    let _guard = match log_target(hosted_path, cli.log_path.as_deref()) {
        Some(target) => logging::init(&level, target),
        None => {
            let path = hosted_path.unwrap_or_default();
            tracing::warn!(path, "session 0 but not started by the service manager, logging to the hosted log file");
            eprintln!("service manager dispatcher unavailable, logs are written to {}", path);
            None
        }
    };
    tracing::debug!(path = %settings_path, "settings loaded");

    match cli.command {
        CliCommand::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        CliCommand::Run => {
            console::run(&settings)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let scm = native?;
    let registry = build_registry(&settings, scm.clone())?;
    let targets = select(&registry, cli.command.target())?;

    let mut failed = false;
    for service in targets {
        let name = service.service_name();

        let result = match &cli.command {
            CliCommand::Install { .. } => install(scm.as_ref(), &settings, name),
            CliCommand::Uninstall { .. } => service.uninstall(),
            CliCommand::Start { .. } => start(scm.as_ref(), name),
            CliCommand::Stop { .. } => stop(scm.as_ref(), name),
            CliCommand::Status { .. } => {
                status(scm.as_ref(), service);
                Ok(())
            }
            CliCommand::Control { code, .. } => {
                service.control(*code);
                Ok(())
            }
            CliCommand::Run | CliCommand::Version => Ok(()),
        };

        if let Err(error) = result {
            println!("{}: {}", name, error);
            failed = true;
        }
    }

    if failed {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// File subscriber installed before handing the main thread to the OS dispatcher.
struct HostedLog {
    path: String,
    _guard: Option<WorkerGuard>,
}

/// Returns true once the OS dispatcher ran the hosted services to completion.
fn check_in(scm: Arc<dyn ScmBackend>) -> Result<(bool, HostedLog), CliError> {
    let loaded = HostSettings::load(None);
    let settings = match &loaded {
        Ok((settings, _)) => settings.clone(),
        Err(_) => HostSettings::default(),
    };

    let level = settings.log_level.clone().unwrap_or_else(|| "info".to_string());
    let path = settings.hosted_log_path();
    let guard = logging::init(&level, LogTarget::File(&path));

    if let Err(error) = &loaded {
        tracing::error!(%error, "failed to load settings, using defaults");
    }

    let registry = Arc::new(build_registry(&settings, scm.clone())?);
    let finished = registry.check_in_main(scm.as_ref());
    Ok((finished, HostedLog { path, _guard: guard }))
}

/// None while the hosted log subscriber from check-in is installed, a global
/// subscriber can only be set once.
fn log_target<'a>(hosted_path: Option<&'a str>, log_path: Option<&'a str>) -> Option<LogTarget<'a>> {
    if hosted_path.is_some() {
        return None;
    }

    match log_path {
        Some(path) => Some(LogTarget::File(path)),
        None => Some(LogTarget::Stderr),
    }
}

/// One heartbeat service per configured name.
pub fn build_registry(settings: &HostSettings, scm: Arc<dyn ScmBackend>) -> Result<ServiceRegistry, RegistryError> {
    let mut registry = ServiceRegistry::new();

    for service in settings.services() {
        let interval = Duration::from_millis(service.heartbeat_interval_ms.max(1));
        registry.register(ServiceImplementation::new(
            &service.name,
            scm.clone(),
            HeartbeatService::new(&service.name, interval),
        ))?;
    }

    Ok(registry)
}

fn select<'a>(registry: &'a ServiceRegistry, name: Option<&str>) -> Result<Vec<&'a Arc<ServiceImplementation>>, CliError> {
    match name {
        Some(name) => match registry.find(name) {
            Some(service) => Ok(vec![service]),
            None => Err(CliError::UnknownService(name.to_string())),
        },
        None => Ok(registry.iter().collect()),
    }
}

fn install(scm: &dyn ScmBackend, settings: &HostSettings, name: &str) -> Result<(), OsError> {
    let display_name = settings
        .service(name)
        .map(|service| service.display_name().to_string())
        .unwrap_or_else(|| name.to_string());

    let binary = ServiceImplementation::binary_path()?;
    ServiceManager::new(scm, false).install_with_display_name(name, &display_name, &binary)?;

    println!("{}: installed", name);
    Ok(())
}

fn start(scm: &dyn ScmBackend, name: &str) -> Result<(), OsError> {
    let mut handle = ServiceHandle::open(scm, name, false);
    if !handle.needs_start() {
        println!("{}: already running", name);
        return Ok(());
    }

    handle.start()?;
    println!("{}: started", name);
    Ok(())
}

fn stop(scm: &dyn ScmBackend, name: &str) -> Result<(), OsError> {
    let mut handle = ServiceHandle::open(scm, name, false);
    if !handle.needs_stop() {
        println!("{}: not running", name);
        return Ok(());
    }

    handle.stop()?;
    let state = handle.last_status().map(|status| status.current_state.name()).unwrap_or("Unknown");
    println!("{}: stop requested ({})", name, state);
    Ok(())
}

fn status(scm: &dyn ScmBackend, service: &ServiceImplementation) {
    let name = service.service_name();
    if !service.installed() {
        println!("{}: not installed", name);
        return;
    }

    let mut handle = ServiceHandle::open(scm, name, true);
    match handle.query() {
        Ok(state) => println!(
            "{}: {} (needs start: {}, needs stop: {})",
            name,
            state.name(),
            handle.needs_start(),
            handle.needs_stop()
        ),
        Err(error) => println!("{}: cannot query state: {}", name, error),
    }
}

#[derive(Debug)]
pub enum CliError {
    LoadSettings(LoadSettingsError),
    Os(OsError),
    Registry(RegistryError),
    UnknownService(String),
    IoError(std::io::Error),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::LoadSettings(error) => write!(f, "{}", error),
            CliError::Os(error) => write!(f, "{}", error),
            CliError::Registry(error) => write!(f, "{}", error),
            CliError::UnknownService(name) => write!(f, "service {} is not configured", name),
            CliError::IoError(error) => write!(f, "IO error: {}", error),
        }
    }
}

impl std::error::Error for CliError {}

impl From<LoadSettingsError> for CliError {
    fn from(e: LoadSettingsError) -> Self {
        CliError::LoadSettings(e)
    }
}

impl From<OsError> for CliError {
    fn from(e: OsError) -> Self {
        CliError::Os(e)
    }
}

impl From<RegistryError> for CliError {
    fn from(e: RegistryError) -> Self {
        CliError::Registry(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::IoError(e)
    }
}
