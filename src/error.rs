//! Webble errors

/// The error type for Bluetooth operations
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    message: String,
}

impl Error {
    /// Creates a new error.
    ///
    /// Native stack implementations use this to report failures, attaching their own error as `source` where one is
    /// available.
    pub fn new(
        kind: ErrorKind,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            kind,
            source,
            message: message.into(),
        }
    }

    /// Returns the corresponding [ErrorKind] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Replaces the message of this error, keeping its kind and source.
    pub(crate) fn with_message(self, message: impl Into<String>) -> Self {
        Error {
            message: message.into(),
            ..self
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind),
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message),
            (true, Some(err)) => write!(f, "{}: {}", &self.kind, err),
            (false, Some(err)) => write!(f, "{}: {} ({})", &self.kind, &self.message, err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = &**x;
            x
        })
    }
}

/// A list of general categories of Bluetooth error.
#[non_exhaustive]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// the Bluetooth adapter is not available
    AdapterUnavailable,
    /// a device request is already in progress
    RequestInProgress,
    /// connection failed
    ConnectionFailed,
    /// the Bluetooth device is already connected
    AlreadyConnected,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// the Bluetooth operation is unsupported
    NotSupported,
    /// permission denied
    NotAuthorized,
    /// not found
    NotFound,
    /// no devices found
    NoDevicesFound,
    /// the request was cancelled
    Cancelled,
    /// invalid parameter
    InvalidParameter,
    /// timed out
    Timeout,
    /// an internal error has occured
    Internal,
    /// error
    Other,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::new(ErrorKind::InvalidParameter, None, "empty filter specified");
        assert_eq!(err.to_string(), "invalid parameter: empty filter specified");

        let err: Error = ErrorKind::NotConnected.into();
        assert_eq!(err.to_string(), "the Bluetooth device isn't connected");
    }

    #[test]
    fn with_message_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "radio busy");
        let err = Error::new(ErrorKind::Other, Some(Box::new(io)), "").with_message("notify failed to enable");
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.message(), "notify failed to enable");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "error: notify failed to enable (radio busy)");
    }
}
