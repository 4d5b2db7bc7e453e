//! Error types for the TWAI utility
//!
//! `TwaiError` is what every core operation returns. Text-codec failures are
//! reported as `ParseError` and transceiver failures as `DriverError`; both
//! convert into `TwaiError`. `ErrorKind` is the coarse classification the
//! console turns into exit codes.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for TWAI operations
pub type Result<T> = std::result::Result<T, TwaiError>;

/// Result type alias for transceiver back-ends
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Coarse outcome classification of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad controller id, malformed text, out-of-range value
    InvalidArgument,
    /// Operation incompatible with the current lifecycle state
    InvalidState,
    /// Queue, task or filter-bank allocation failed
    ResourceExhausted,
    /// The transceiver rejected an operation
    Driver,
    /// A bounded wait elapsed
    Timeout,
}

impl ErrorKind {
    /// Console exit status for this kind
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => 1,
            ErrorKind::InvalidState => 2,
            ErrorKind::ResourceExhausted => 3,
            ErrorKind::Driver => 4,
            ErrorKind::Timeout => 5,
        }
    }
}

/// Failures of the frame, filter and selector notations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing '#' separator between identifier and payload")]
    MissingSeparator,

    #[error("identifier must be 3 (standard) or 8 (extended) hex digits, got {0}")]
    InvalidIdLength(usize),

    #[error("identifier out of range: 0x{id:X} (extended: {extended})")]
    IdOutOfRange { id: u32, extended: bool },

    #[error("invalid hex digit '{ch}' at position {pos}")]
    InvalidHexDigit { ch: char, pos: usize },

    #[error("incomplete data byte at position {0}")]
    IncompleteByte(usize),

    #[error("payload too long: maximum is {max} bytes ({mode} mode)")]
    PayloadTooLong { max: usize, mode: &'static str },

    #[error("missing or invalid FD flags (expected one hex digit 0-3)")]
    InvalidFdFlags,

    #[error("RTR length must be a single hex digit 0-8")]
    InvalidRtrLength,

    #[error("DLC suffix '_<code>' needs exactly 8 data bytes and one hex digit")]
    InvalidDlcSuffix,

    #[error("unexpected trailing input at position {0}")]
    TrailingInput(usize),

    #[error("filter expression must be shorter than {0} characters")]
    FilterTooLong(usize),

    #[error("invalid filter token '{0}' (expected id:mask or low-high)")]
    InvalidFilterToken(String),

    #[error("range filters are not supported by this controller: '{0}'")]
    RangeFilterUnsupported(String),

    #[error("invalid range 0x{low:X}-0x{high:X}: low must not exceed high")]
    InvertedRange { low: u32, high: u32 },

    #[error("too many mask filters (controller has {0} banks)")]
    TooManyMaskFilters(usize),

    #[error("too many range filters (controller has {0} banks)")]
    TooManyRangeFilters(usize),

    #[error("invalid controller '{0}' (expected twai<N>)")]
    InvalidController(String),

    #[error("invalid timestamp mode '{0}' (use a/d/z/n)")]
    InvalidTimestampMode(String),
}

impl ParseError {
    /// Check if this error reports a filter-bank overflow
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            ParseError::TooManyMaskFilters(_) | ParseError::TooManyRangeFilters(_)
        )
    }
}

/// Failures reported by a transceiver back-end
#[derive(Error, Debug)]
pub enum DriverError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No supported USB adapter found
    #[error("No GS-USB device found")]
    DeviceNotFound,

    /// Session is not enabled
    #[error("Controller {0} is not enabled")]
    NotEnabled(usize),

    /// A session is already open on this controller
    #[error("Controller {0} already has an open session")]
    SessionBusy(usize),

    /// Unsupported bitrate for the adapter clock
    #[error("Unsupported bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedBitrate { bitrate: u32, clock_hz: u32 },

    /// Unsupported data bitrate for CAN FD
    #[error("Unsupported data bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedDataBitrate { bitrate: u32, clock_hz: u32 },

    /// Adapter does not support CAN FD
    #[error("Device does not support CAN FD")]
    FdNotSupported,

    /// Filter bank index outside the hardware range
    #[error("Filter index {index} out of range ({available} banks)")]
    FilterIndex { index: usize, available: usize },

    /// Transmit queue is full
    #[error("Transmit queue full")]
    TxQueueFull,

    /// Bus state query is not supported
    #[error("Device does not support bus state queries")]
    StateNotSupported,

    /// Invalid response from the adapter
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// Operation rejected by the transceiver
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

/// Error type of every core operation
#[derive(Error, Debug)]
pub enum TwaiError {
    /// Controller id outside the configured controller range
    #[error("Invalid controller ID: {id} (supported: 0..{count})")]
    InvalidController { id: usize, count: usize },

    /// Malformed frame, filter or selector text
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Other argument validation failure
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation incompatible with the controller's state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Allocation of a queue or task failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The transceiver rejected an operation
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// A bounded wait elapsed
    #[error("{operation} timed out after {} ms", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl TwaiError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TwaiError::InvalidController { .. } | TwaiError::InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
            TwaiError::Parse(e) if e.is_capacity_error() => ErrorKind::ResourceExhausted,
            TwaiError::Parse(_) => ErrorKind::InvalidArgument,
            TwaiError::InvalidState(_) => ErrorKind::InvalidState,
            TwaiError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            TwaiError::Driver(_) => ErrorKind::Driver,
            TwaiError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Console exit status for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Check if this error came from the transceiver
    pub fn is_driver_error(&self) -> bool {
        self.kind() == ErrorKind::Driver
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        TwaiError::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_have_distinct_exit_codes() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidState,
            ErrorKind::ResourceExhausted,
            ErrorKind::Driver,
            ErrorKind::Timeout,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_filter_overflow_is_resource_exhausted() {
        let err = TwaiError::from(ParseError::TooManyMaskFilters(3));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = TwaiError::from(ParseError::InvertedRange {
            low: 0x200,
            high: 0x100,
        });
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_driver_and_timeout_predicates() {
        let err = TwaiError::from(DriverError::NotEnabled(0));
        assert!(err.is_driver_error());
        assert!(!err.is_timeout());

        let err = TwaiError::Timeout {
            operation: "transmit",
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "transmit timed out after 50 ms");
    }
}
