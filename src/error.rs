//! Error types and Result alias for binstore

use std::fmt;

/// Error categories surfaced by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Underlying I/O failure; recoverable by the caller
    IoErr,
    /// On-disk structure is damaged (bad magic, mismatched boundary
    /// tags, pointer out of range, double free, missing bin entry)
    Corrupt,
    /// Write attempted through a read-only handle
    ReadOnly,
    /// API misuse (out-of-bounds position, shrink request, operation
    /// on a closed store)
    Misuse,
}

impl ErrorCode {
    /// Default human-readable text for the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "store is corrupt",
            ErrorCode::ReadOnly => "attempt to write a read-only store",
            ErrorCode::Misuse => "library routine called out of sequence",
        }
    }
}

/// Error value carrying a code and an optional detail message.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    message: Option<String>,
}

impl Error {
    /// Create an error with the default message for `code`
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    /// Create an error with a specific detail message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    /// The detail message, or the code's default text
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.code.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code.as_str(), msg),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErr, err.to_string())
    }
}

/// Result type alias for binstore operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_messages() {
        let err = Error::new(ErrorCode::Corrupt);
        assert_eq!(err.code, ErrorCode::Corrupt);
        assert_eq!(err.message(), "store is corrupt");
    }

    #[test]
    fn test_detail_message() {
        let err = Error::with_message(ErrorCode::Misuse, "position out of bounds");
        assert_eq!(err.message(), "position out of bounds");
        assert_eq!(
            format!("{}", err),
            format!("{}: position out of bounds", ErrorCode::Misuse.as_str())
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.code, ErrorCode::IoErr);
    }
}
