//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - ServiceError covers startup, bind and spawn failures; it never crosses the wire.
//! - ParseError and RequestError are rendered into `FAILURE` responses by the protocol layer.
use std::fmt;
use std::io;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

#[derive(Debug)]
pub enum ServiceError {
    Io(io::Error),
    Message(String),
}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        ServiceError::Io(e)
    }
}

impl From<nix::errno::Errno> for ServiceError {
    fn from(e: nix::errno::Errno) -> Self {
        ServiceError::Io(io::Error::from(e))
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Io(e) => write!(f, "{e}"),
            ServiceError::Message(s) => f.write_str(s),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Io(e) => Some(e),
            ServiceError::Message(_) => None,
        }
    }
}

/// Convert ServiceError to exit code (parity with io::Error mapping).
pub fn exit_code_for_service_error(e: &ServiceError) -> u8 {
    match e {
        ServiceError::Io(ioe) => exit_code_for_io_error(ioe),
        ServiceError::Message(_) => 1,
    }
}

/// A request that was read completely but could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        ParseError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ParseError {}

/// Failure to read a complete request off a control connection.
#[derive(Debug)]
pub enum RequestError {
    TimedOut,
    Closed,
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RequestError::TimedOut,
            _ => RequestError::Io(e),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::TimedOut => f.write_str("request timed out"),
            RequestError::Closed => f.write_str("connection closed before request was complete"),
            RequestError::TooLarge => f.write_str("request too large"),
            RequestError::Io(e) => write!(f, "request read failed: {e}"),
        }
    }
}

impl std::error::Error for RequestError {}
