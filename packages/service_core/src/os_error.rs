use std::error::Error;
use std::fmt::{Display, Formatter};

/// An error code reported by the service control manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsError(pub u32);

impl OsError {
    pub const ACCESS_DENIED: OsError = OsError(5);
    pub const INVALID_HANDLE: OsError = OsError(6);
    pub const NOT_SUPPORTED: OsError = OsError(50);
    pub const INVALID_PARAMETER: OsError = OsError(87);
    pub const CALL_NOT_IMPLEMENTED: OsError = OsError(120);
    pub const INVALID_FLAGS: OsError = OsError(1004);
    pub const INVALID_SERVICE_CONTROL: OsError = OsError(1052);
    pub const SERVICE_ALREADY_RUNNING: OsError = OsError(1056);
    pub const SERVICE_DOES_NOT_EXIST: OsError = OsError(1060);
    pub const SERVICE_NOT_ACTIVE: OsError = OsError(1062);
    pub const FAILED_SERVICE_CONTROLLER_CONNECT: OsError = OsError(1063);
    pub const SERVICE_MARKED_FOR_DELETE: OsError = OsError(1072);
    pub const SERVICE_EXISTS: OsError = OsError(1073);

    pub fn code(&self) -> u32 {
        self.0
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            OsError::ACCESS_DENIED => "ERROR_ACCESS_DENIED",
            OsError::INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            OsError::NOT_SUPPORTED => "ERROR_NOT_SUPPORTED",
            OsError::INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            OsError::CALL_NOT_IMPLEMENTED => "ERROR_CALL_NOT_IMPLEMENTED",
            OsError::INVALID_FLAGS => "ERROR_INVALID_FLAGS",
            OsError::INVALID_SERVICE_CONTROL => "ERROR_INVALID_SERVICE_CONTROL",
            OsError::SERVICE_ALREADY_RUNNING => "ERROR_SERVICE_ALREADY_RUNNING",
            OsError::SERVICE_DOES_NOT_EXIST => "ERROR_SERVICE_DOES_NOT_EXIST",
            OsError::SERVICE_NOT_ACTIVE => "ERROR_SERVICE_NOT_ACTIVE",
            OsError::FAILED_SERVICE_CONTROLLER_CONNECT => "ERROR_FAILED_SERVICE_CONTROLLER_CONNECT",
            OsError::SERVICE_MARKED_FOR_DELETE => "ERROR_SERVICE_MARKED_FOR_DELETE",
            OsError::SERVICE_EXISTS => "ERROR_SERVICE_EXISTS",
            _ => return None,
        };
        Some(name)
    }
}

impl Display for OsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "error {}", self.0),
        }
    }
}

impl Error for OsError {}

impl From<std::io::Error> for OsError {
    fn from(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(code) => OsError(code as u32),
            None => OsError::INVALID_PARAMETER,
        }
    }
}
