// src/io/error.rs
//
// Error types for the serial line, the slcan codec and the CAN interface.

use thiserror::Error;

/// A command line that could not be decoded. Always answered with a bell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed line: {0}")]
    Malformed(String),
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
}

impl DecodeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        DecodeError::Malformed(message.into())
    }

    pub fn invalid_operand(message: impl Into<String>) -> Self {
        DecodeError::InvalidOperand(message.into())
    }
}

/// Failure reading lines from the serial stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No terminator within the line bound. The line is dropped.
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
    #[error("serial read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// CAN interface failures.
#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("interface {0} not found")]
    NotFound(String),
    #[error("permission denied on interface {0}")]
    PermissionDenied(String),
    #[error("interface must be down to change its configuration")]
    BusyWhileUp,
    #[error("interface is down")]
    Down,
    #[error("interface transmit buffer is full")]
    TxBufferFull,
    #[error("no bitrate configured")]
    NoBitrateConfigured,
    #[error("{0}")]
    Unsupported(String),
    #[error("link configuration failed: {0}")]
    Link(String),
    #[error("interface I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IfaceError {
    /// Startup attach failures that leave nothing to retry
    pub fn is_fatal_on_attach(&self) -> bool {
        matches!(self, IfaceError::NotFound(_) | IfaceError::PermissionDenied(_))
    }
}

/// Device-level errors raised while opening or driving a transport.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_messages() {
        let err = IoError::connection("serial(/dev/ttyUSB0)", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "serial(/dev/ttyUSB0): connection failed: No such file or directory"
        );
        assert_eq!(
            IoError::configuration("bad baud rate").to_string(),
            "configuration error: bad baud rate"
        );
    }

    #[test]
    fn test_fatal_attach_errors() {
        assert!(IfaceError::NotFound("can0".into()).is_fatal_on_attach());
        assert!(IfaceError::PermissionDenied("can0".into()).is_fatal_on_attach());
        assert!(!IfaceError::TxBufferFull.is_fatal_on_attach());
        assert!(!IfaceError::Down.is_fatal_on_attach());
    }
}
