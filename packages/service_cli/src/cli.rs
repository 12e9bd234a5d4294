use clap::{Parser, Subcommand};

use service_host_core::ServiceControl;

#[derive(Parser)]
#[command(name = "service-host", about = "Hosts named background services in a single executable")]
pub struct Cli {
    #[arg(long, global = true)]
    pub settings_path: Option<String>,
    #[arg(long, global = true)]
    pub log_path: Option<String>,
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Clone, Subcommand)]
pub enum CliCommand {
    /// Register services with the OS service manager
    #[command(name = "install")]
    Install { name: Option<String> },
    #[command(name = "uninstall")]
    Uninstall { name: Option<String> },
    #[command(name = "start")]
    Start { name: Option<String> },
    #[command(name = "stop")]
    Stop { name: Option<String> },
    #[command(name = "status")]
    Status { name: Option<String> },
    /// Send a user defined control code (128-255)
    #[command(name = "control")]
    Control {
        #[arg(value_parser = clap::value_parser!(u8).range(ServiceControl::USER_DEFINED_MIN as i64..=255))]
        code: u8,
        name: Option<String>,
    },
    /// Host the configured services in this console until Ctrl+C
    #[command(name = "run")]
    Run,
    #[command(name = "version")]
    Version,
}

impl CliCommand {
    pub fn target(&self) -> Option<&str> {
        match self {
            CliCommand::Install { name }
            | CliCommand::Uninstall { name }
            | CliCommand::Start { name }
            | CliCommand::Stop { name }
            | CliCommand::Status { name }
            | CliCommand::Control { name, .. } => name.as_deref(),
            CliCommand::Run | CliCommand::Version => None,
        }
    }
}
