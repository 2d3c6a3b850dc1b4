use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExposureError {
    #[error("export does not begin with the EK export header")]
    BadHeader,

    #[error("malformed export framing: {0}")]
    Parse(&'static str),

    #[error("export byte source failed")]
    Io(#[from] std::io::Error),

    #[error("crypto primitive failed: {0}")]
    Crypto(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported HKDF output length {0}, only 16 is defined")]
    UnsupportedLength(usize),
}

/// Host-facing status codes, surfaced verbatim by layers wrapping the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    InternalError = 8,
    Failed = 13,
    FailedRejectedOptIn = 39500,
    FailedServiceDisabled = 39501,
    FailedBluetoothDisabled = 39502,
    FailedTemporarilyDisabled = 39503,
    FailedDiskIo = 39506,
    FailedUnauthorized = 39507,
    FailedRateLimited = 39508,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<&ExposureError> for StatusCode {
    fn from(error: &ExposureError) -> Self {
        match error {
            ExposureError::Io(_) => StatusCode::FailedDiskIo,
            ExposureError::Crypto(_) => StatusCode::InternalError,
            ExposureError::InvalidArgument(_) => StatusCode::InternalError,
            ExposureError::UnsupportedLength(_) => StatusCode::InternalError,
            ExposureError::BadHeader => StatusCode::Failed,
            ExposureError::Parse(_) => StatusCode::Failed,
        }
    }
}
