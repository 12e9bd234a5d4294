use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVICE_NAME: &str = "service-host";
const SETTINGS_FILE: &str = "service-host.toml";
const LOG_FILE: &str = "service-host.log";

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct HostSettings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceSettings>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub name: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl ServiceSettings {
    pub fn named(name: &str) -> Self {
        ServiceSettings {
            name: name.to_string(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            display_name: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

impl HostSettings {
    /// Reads settings from `path` or the default location. A missing file
    /// yields the defaults.
    pub fn load(path: Option<String>) -> Result<(Self, String), LoadSettingsError> {
        let path = match path {
            Some(v) => v,
            None => Self::get_default_path(),
        };

        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HostSettings::default(), path));
            }
            Err(error) => return Err(LoadSettingsError::IoError(error)),
        };

        let settings = Self::parse(&data)?;
        Ok((settings, path))
    }

    pub fn parse(data: &str) -> Result<Self, LoadSettingsError> {
        toml::from_str(data).map_err(|error| LoadSettingsError::ParseError(error.to_string()))
    }

    pub fn get_default_path() -> String {
        if Path::new(SETTINGS_FILE).exists() {
            return SETTINGS_FILE.to_string();
        }

        let Some(config_path) = dirs::config_local_dir() else {
            return SETTINGS_FILE.to_string();
        };

        config_path.join("service_host").join(SETTINGS_FILE).to_string_lossy().to_string()
    }

    /// Log file used when running under the OS service manager.
    pub fn hosted_log_path(&self) -> String {
        if let Some(path) = &self.log_path {
            return path.clone();
        }

        let Some(config_path) = dirs::config_local_dir() else {
            return LOG_FILE.to_string();
        };

        config_path.join("service_host").join(LOG_FILE).to_string_lossy().to_string()
    }

    /// Configured services, or the single default service when none are listed.
    pub fn services(&self) -> Vec<ServiceSettings> {
        if self.services.is_empty() {
            return vec![ServiceSettings::named(DEFAULT_SERVICE_NAME)];
        }
        self.services.clone()
    }

    pub fn service(&self, name: &str) -> Option<ServiceSettings> {
        self.services()
            .into_iter()
            .find(|service| service.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug)]
pub enum LoadSettingsError {
    IoError(std::io::Error),
    ParseError(String),
}

impl Display for LoadSettingsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadSettingsError::IoError(error) => write!(f, "failed to read settings: {}", error),
            LoadSettingsError::ParseError(error) => write!(f, "failed to parse settings: {}", error),
        }
    }
}

impl std::error::Error for LoadSettingsError {}

#[cfg(test)]
mod test {
    use super::{DEFAULT_SERVICE_NAME, HostSettings, LoadSettingsError};

    #[test]
    fn parse_full_settings() {
        let settings = HostSettings::parse(
            r#"
            log_level = "debug"
            log_path = "/var/log/service-host.log"

            [[services]]
            name = "alpha"
            heartbeat_interval_ms = 250
            display_name = "Alpha Service"

            [[services]]
            name = "beta"
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_level.as_deref(), Some("debug"));
        let services = settings.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].heartbeat_interval_ms, 250);
        assert_eq!(services[0].display_name(), "Alpha Service");
        assert_eq!(services[1].heartbeat_interval_ms, 1000);
        assert_eq!(services[1].display_name(), "beta");
        assert_eq!(settings.service("BETA").unwrap().name, "beta");
    }

    #[test]
    fn empty_settings_host_default_service() {
        let settings = HostSettings::parse("").unwrap();
        let services = settings.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("service-host-missing-settings.toml");
        let (settings, loaded) = HostSettings::load(Some(path.to_string_lossy().to_string())).unwrap();
        assert_eq!(settings, HostSettings::default());
        assert_eq!(loaded, path.to_string_lossy());
    }

    #[test]
    fn invalid_settings_fail_to_parse() {
        assert!(matches!(
            HostSettings::parse("services = 5"),
            Err(LoadSettingsError::ParseError(_))
        ));
    }
}
