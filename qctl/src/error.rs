/// A failed call into the kernel scheduler or token-bucket device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed: {}", os_error(.code))]
pub struct DeviceError {
    /// The device operation that failed, e.g. `"add_class"`.
    pub op: &'static str,
    /// The OS error code reported by the device.
    pub code: i32,
}

fn os_error(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

impl DeviceError {
    /// Creates a new device error.
    pub const fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

/// Errors of the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("system call failed: {0}")]
    SysCall(#[from] DeviceError),
    #[error("out of memory")]
    NoMemory,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("bad interface: {0}")]
    BadInterface(String),
    #[error("bad class: {0}")]
    BadClass(String),
    #[error("bad filter: {0}")]
    BadFilter(String),
    #[error("class error: {0}")]
    Class(String),
    #[error("class operation not permitted: {0}")]
    ClassPermission(String),
    #[error("invalid class: {0}")]
    ClassInvalid(String),
    #[error("filter {filter} is shadowed by {existing}")]
    FilterShadow { filter: String, existing: String },
    #[error("admission control failed: {0}")]
    Admission(String),
    #[error("admission control failed, no bandwidth: {0}")]
    AdmissionNoBandwidth(String),
}

impl Error {
    /// Returns true for the class configuration errors ([`Error::Class`],
    /// [`Error::ClassPermission`] and [`Error::ClassInvalid`]).
    pub const fn is_class_error(&self) -> bool {
        matches!(self, Self::Class(_) | Self::ClassPermission(_) | Self::ClassInvalid(_))
    }

    /// Returns true if admission control rejected the operation.
    pub const fn is_admission_error(&self) -> bool {
        matches!(self, Self::Admission(_) | Self::AdmissionNoBandwidth(_))
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::NoMemory
    }
}

/// Result type of the control plane.
pub type Result<T> = std::result::Result<T, Error>;
