use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStateKind {
    Unknown,
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceStateKind {
    /// Maps the OS numeric state, out of range values become `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ServiceStateKind::Stopped,
            2 => ServiceStateKind::StartPending,
            3 => ServiceStateKind::StopPending,
            4 => ServiceStateKind::Running,
            5 => ServiceStateKind::ContinuePending,
            6 => ServiceStateKind::PausePending,
            7 => ServiceStateKind::Paused,
            _ => ServiceStateKind::Unknown,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            ServiceStateKind::Unknown => 0,
            ServiceStateKind::Stopped => 1,
            ServiceStateKind::StartPending => 2,
            ServiceStateKind::StopPending => 3,
            ServiceStateKind::Running => 4,
            ServiceStateKind::ContinuePending => 5,
            ServiceStateKind::PausePending => 6,
            ServiceStateKind::Paused => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceStateKind::Unknown => "Unknown",
            ServiceStateKind::Stopped => "Stopped",
            ServiceStateKind::StartPending => "Start Pending",
            ServiceStateKind::StopPending => "Stop Pending",
            ServiceStateKind::Running => "Running",
            ServiceStateKind::ContinuePending => "Continue Pending",
            ServiceStateKind::PausePending => "Pause Pending",
            ServiceStateKind::Paused => "Paused",
        }
    }
}

impl Display for ServiceStateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#X})", self.name(), self.to_raw())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    OwnProcess,
    ShareProcess,
    KernelDriver,
    FileSystemDriver,
}

impl ServiceType {
    /// Drivers cannot be watched with status change notifications.
    pub fn is_driver(self) -> bool {
        matches!(self, ServiceType::KernelDriver | ServiceType::FileSystemDriver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    Auto,
    Demand,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorControl {
    Ignore,
    Normal,
    Severe,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlsAccepted {
    pub stop: bool,
    pub session_change: bool,
}

impl Default for ControlsAccepted {
    fn default() -> Self {
        ControlsAccepted {
            stop: true,
            session_change: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service_type: ServiceType,
    pub current_state: ServiceStateKind,
    pub controls_accepted: ControlsAccepted,
    pub exit_code: u32,
    pub service_specific_exit_code: u32,
    pub checkpoint: u32,
    pub wait_hint: Duration,
}

impl ServiceStatus {
    pub const DEFAULT_WAIT_HINT: Duration = Duration::from_secs(30);
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus {
            service_type: ServiceType::OwnProcess,
            current_state: ServiceStateKind::Stopped,
            controls_accepted: ControlsAccepted::default(),
            exit_code: 0,
            service_specific_exit_code: 0,
            checkpoint: 0,
            wait_hint: Self::DEFAULT_WAIT_HINT,
        }
    }
}

/// Request delivered by the OS to a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControl {
    Stop,
    Pause,
    Continue,
    Interrogate,
    Shutdown,
    ParamChange,
    SessionChange,
    /// Custom code in the 128..=255 range.
    UserDefined(u8),
    Other(u32),
}

impl ServiceControl {
    pub const USER_DEFINED_MIN: u8 = 128;

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ServiceControl::Stop,
            2 => ServiceControl::Pause,
            3 => ServiceControl::Continue,
            4 => ServiceControl::Interrogate,
            5 => ServiceControl::Shutdown,
            6 => ServiceControl::ParamChange,
            14 => ServiceControl::SessionChange,
            128..=255 => ServiceControl::UserDefined(raw as u8),
            other => ServiceControl::Other(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            ServiceControl::Stop => 1,
            ServiceControl::Pause => 2,
            ServiceControl::Continue => 3,
            ServiceControl::Interrogate => 4,
            ServiceControl::Shutdown => 5,
            ServiceControl::ParamChange => 6,
            ServiceControl::SessionChange => 14,
            ServiceControl::UserDefined(code) => code as u32,
            ServiceControl::Other(code) => code,
        }
    }
}

impl Display for ServiceControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceControl::UserDefined(code) => write!(f, "UserDefined({})", code),
            ServiceControl::Other(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    NoError,
    NotImplemented,
}

/// Set of states a status change notification waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyMask(u32);

impl NotifyMask {
    pub const STOPPED: NotifyMask = NotifyMask(0x01);
    pub const START_PENDING: NotifyMask = NotifyMask(0x02);
    pub const STOP_PENDING: NotifyMask = NotifyMask(0x04);
    pub const RUNNING: NotifyMask = NotifyMask(0x08);
    pub const CONTINUE_PENDING: NotifyMask = NotifyMask(0x10);
    pub const PAUSE_PENDING: NotifyMask = NotifyMask(0x20);
    pub const PAUSED: NotifyMask = NotifyMask(0x40);

    pub fn with(self, other: NotifyMask) -> Self {
        NotifyMask(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains_state(self, state: ServiceStateKind) -> bool {
        match state {
            ServiceStateKind::Unknown => false,
            state => self.0 & (1 << (state.to_raw() - 1)) != 0,
        }
    }
}

impl std::ops::BitOr for NotifyMask {
    type Output = NotifyMask;

    fn bitor(self, rhs: NotifyMask) -> NotifyMask {
        self.with(rhs)
    }
}

/// Callback fired once with the status that satisfied a notification request.
pub type StatusNotify = Box<dyn FnOnce(ServiceStatus) + Send + 'static>;

#[cfg(test)]
mod test {
    use super::{NotifyMask, ServiceControl, ServiceStateKind};

    #[test]
    fn state_names_match_raw_values() {
        assert_eq!(ServiceStateKind::from_raw(3).name(), "Stop Pending");
        assert_eq!(ServiceStateKind::from_raw(42), ServiceStateKind::Unknown);
        assert_eq!(ServiceStateKind::Running.to_string(), "Running(0x4)");
    }

    #[test]
    fn notify_mask_selects_states() {
        let mask = NotifyMask::STOPPED | NotifyMask::RUNNING;
        assert!(mask.contains_state(ServiceStateKind::Stopped));
        assert!(mask.contains_state(ServiceStateKind::Running));
        assert!(!mask.contains_state(ServiceStateKind::StopPending));
        assert!(!mask.contains_state(ServiceStateKind::Unknown));
    }

    #[test]
    fn user_defined_controls() {
        assert_eq!(ServiceControl::from_raw(130), ServiceControl::UserDefined(130));
        assert_eq!(ServiceControl::from_raw(1), ServiceControl::Stop);
        assert_eq!(ServiceControl::UserDefined(200).to_raw(), 200);
        assert_eq!(ServiceControl::from_raw(99).to_string(), "Unknown(99)");
    }
}
