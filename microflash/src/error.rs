//! Error types for microflash.
//!
//! Low-level failures are reported through [`Error`]. The connection layer
//! folds every failure that escapes a public operation into a
//! [`DeviceError`] carrying one of a small set of user-facing codes.

use std::io;
use thiserror::Error;

/// Result type for microflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for microflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, USB enumeration).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// USB transfer error.
    #[cfg(feature = "native")]
    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// The probe answered a command with a different command id.
    #[error("Bad response for {expected:#04x} -> {actual:#04x}")]
    BadResponse {
        /// Command id that was sent.
        expected: u8,
        /// Command id found in the response.
        actual: u8,
    },

    /// The probe rejected a command.
    #[error("Bad status for {command:#04x} -> {status:#04x}")]
    BadStatus {
        /// Command id that was sent.
        command: u8,
        /// Status byte returned by the probe.
        status: u8,
    },

    /// A register transfer completed fewer operations than requested.
    #[error("Transfer count mismatch: expected {expected}, got {actual}")]
    TransferCount {
        /// Number of operations requested.
        expected: usize,
        /// Number of operations the probe reported.
        actual: usize,
    },

    /// The target answered a register transfer with WAIT.
    #[error("Target busy (WAIT response)")]
    TransferWait,

    /// The target answered a register transfer with FAULT or no ACK.
    #[error("Transfer failed with ACK {0:#04x}")]
    TransferFault(u8),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Board geometry was requested before the first connection completed.
    #[error("{0} not defined until connected")]
    NotConnected(&'static str),

    /// No probe was selected or the selected probe went away.
    #[error("No micro:bit selected")]
    NoDeviceSelected,

    /// The USB device has no usable CMSIS-DAP interface.
    #[error("No valid interfaces found")]
    NoValidInterfaces,

    /// The CMSIS-DAP interface is held by another program.
    #[error("Unable to claim interface: {0}")]
    ClaimInterface(#[source] io::Error),

    /// The USB device was unplugged.
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// Invalid argument passed to a target operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Board identifier outside the known micro:bit families.
    #[error("Unrecognized board ID {0:#06x}")]
    UnrecognizedBoard(u16),

    /// The USB serial number could not be decoded.
    #[error("Invalid serial number: {0}")]
    InvalidSerialNumber(String),

    /// The flash data source failed to produce an image.
    #[error(transparent)]
    HexGeneration(#[from] HexGenerationError),

    /// A failure already folded into a user-facing category.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The embedding application requested interruption.
    #[error("Interrupted")]
    Interrupted,

    /// Unsupported platform or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for errors raised while waiting on a deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            #[cfg(feature = "native")]
            Self::Transfer(nusb::transfer::TransferError::Cancelled) => true,
            Self::Device(e) => e.code == DeviceErrorCode::TimeoutError,
            _ => false,
        }
    }

    fn is_disconnect(&self) -> bool {
        match self {
            Self::DeviceDisconnected => true,
            #[cfg(feature = "native")]
            Self::Transfer(nusb::transfer::TransferError::Disconnected) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotConnected,
            _ => false,
        }
    }
}

/// Raised by a flash data source when it cannot produce an image.
///
/// These are application errors: the connection layer passes them through
/// without disconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HexGenerationError(pub String);

/// User-facing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// The DAPLink firmware is too old to expose a usable interface.
    UpdateReq,
    /// Another program holds the interface.
    ClearConnect,
    /// The board was unplugged mid-operation.
    DeviceDisconnected,
    /// The board stopped responding.
    TimeoutError,
    /// Anything else. Replugging the board usually helps.
    ReconnectMicrobit,
}

impl DeviceErrorCode {
    /// Stable string form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdateReq => "update-req",
            Self::ClearConnect => "clear-connect",
            Self::DeviceDisconnected => "device-disconnected",
            Self::TimeoutError => "timeout-error",
            Self::ReconnectMicrobit => "reconnect-microbit",
        }
    }

    /// Short title suitable for a dialog heading.
    pub fn title(self) -> &'static str {
        match self {
            Self::UpdateReq => "Update your micro:bit firmware",
            Self::ClearConnect => "Unable to claim the micro:bit interface",
            Self::DeviceDisconnected => "micro:bit disconnected",
            Self::TimeoutError => "micro:bit stopped responding",
            Self::ReconnectMicrobit => "Reconnect your micro:bit",
        }
    }

    /// Longer explanation, where one helps.
    pub fn description(self) -> Option<&'static str> {
        match self {
            Self::UpdateReq => Some(
                "The interface firmware on this micro:bit is too old for direct flashing. \
                 Update it and try again.",
            ),
            Self::ClearConnect => {
                Some("Close any other program or tab that is connected to the micro:bit.")
            },
            Self::TimeoutError => Some("Unplug the micro:bit, plug it back in and try again."),
            Self::DeviceDisconnected | Self::ReconnectMicrobit => None,
        }
    }
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure surfaced to callers of the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{title} ({code}): {message}")]
pub struct DeviceError {
    /// Failure category.
    pub code: DeviceErrorCode,
    /// Short title.
    pub title: String,
    /// Optional longer explanation.
    pub description: Option<String>,
    /// Message of the underlying error.
    pub message: String,
}

impl DeviceError {
    /// Create an error for `code` with the default title and description.
    pub fn new(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            title: code
                .title()
                .to_string(),
            description: code
                .description()
                .map(str::to_string),
            message: message.into(),
        }
    }

    /// Fold an arbitrary error into a user-facing category.
    pub fn classify(err: &Error) -> Self {
        if let Error::Device(e) = err {
            return e.clone();
        }

        let message = err.to_string();
        let code = match err {
            Error::NoValidInterfaces => DeviceErrorCode::UpdateReq,
            Error::ClaimInterface(_) => DeviceErrorCode::ClearConnect,
            e if e.is_disconnect() => DeviceErrorCode::DeviceDisconnected,
            e if e.is_timeout() => DeviceErrorCode::TimeoutError,
            _ => DeviceErrorCode::ReconnectMicrobit,
        };
        Self::new(code, message)
    }
}

/// Reduce an error message to a slug for event reporting.
///
/// Runs of non-word characters become a single `-`, the result is lowercased
/// and leading or trailing dashes are dropped.
pub fn error_slug(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    let mut in_gap = false;
    for c in message.chars() {
        if c.is_alphanumeric() || c == '_' {
            if in_gap && !slug.is_empty() {
                slug.push('-');
            }
            in_gap = false;
            slug.extend(c.to_lowercase());
        } else {
            in_gap = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(
            DeviceError::classify(&Error::NoValidInterfaces).code,
            DeviceErrorCode::UpdateReq
        );
        let claim = Error::ClaimInterface(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        assert_eq!(
            DeviceError::classify(&claim).code,
            DeviceErrorCode::ClearConnect
        );
        assert_eq!(
            DeviceError::classify(&Error::DeviceDisconnected).code,
            DeviceErrorCode::DeviceDisconnected
        );
        assert_eq!(
            DeviceError::classify(&Error::Timeout("halt".into())).code,
            DeviceErrorCode::TimeoutError
        );
        assert_eq!(
            DeviceError::classify(&Error::TransferFault(4)).code,
            DeviceErrorCode::ReconnectMicrobit
        );
    }

    #[test]
    fn test_classify_keeps_classified_error() {
        let inner = DeviceError::new(DeviceErrorCode::ClearConnect, "held elsewhere");
        let err = Error::Device(inner.clone());
        assert_eq!(DeviceError::classify(&err), inner);
    }

    #[test]
    fn test_classify_message_and_description() {
        let err = DeviceError::classify(&Error::Protocol("bad frame".into()));
        assert_eq!(err.message, "Protocol error: bad frame");
        assert_eq!(err.title, "Reconnect your micro:bit");
        assert!(err.description.is_none());

        let err = DeviceError::classify(&Error::NoValidInterfaces);
        assert!(err.description.is_some());
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(DeviceErrorCode::UpdateReq.as_str(), "update-req");
        assert_eq!(DeviceErrorCode::ReconnectMicrobit.to_string(), "reconnect-microbit");
    }

    #[test]
    fn test_error_slug() {
        assert_eq!(error_slug("Bad status for 0x8a -> 0xff"), "bad-status-for-0x8a-0xff");
        assert_eq!(error_slug("  Timeout: halt  "), "timeout-halt");
        assert_eq!(error_slug("snake_case stays"), "snake_case-stays");
        assert_eq!(error_slug(""), "");
    }
}
