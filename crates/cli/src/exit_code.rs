// Consistent exit codes for the diql CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error (bad config, unknown qube/query)
//   10 = query service not reachable
//   11 = session credential rejected
//   12 = query finished with an exception or was cancelled

use std::fmt;
use std::process;

use diql_client::{CommandError, ConfigError, DocumentError, QueryFailed, TransportError};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Unreachable = 10,
    Auth = 11,
    QueryFailed = 12,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<SessionRejected>().is_some() {
                return Self::Auth;
            }
            if cause.downcast_ref::<ServiceUnreachable>().is_some()
                || cause.downcast_ref::<TransportError>().is_some()
            {
                return Self::Unreachable;
            }
            if cause.downcast_ref::<QueryFailed>().is_some() {
                return Self::QueryFailed;
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Usage;
            }
            if let Some(document_err) = cause.downcast_ref::<DocumentError>() {
                return Self::from_document_error(document_err);
            }
        }
        Self::Error
    }

    fn from_document_error(err: &DocumentError) -> Self {
        match err {
            DocumentError::Invalid(_) => Self::Usage,
            DocumentError::Command(CommandError::Transport(_)) => Self::Unreachable,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// The socket never opened within the connect timeout.
#[derive(Debug)]
pub struct ServiceUnreachable {
    pub url: String,
}

impl fmt::Display for ServiceUnreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not reach the query service at {}", self.url)
    }
}

impl std::error::Error for ServiceUnreachable {}

/// The server answered with `authenticationException`.
#[derive(Debug)]
pub struct SessionRejected;

impl fmt::Display for SessionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the server rejected the session credential")
    }
}

impl std::error::Error for SessionRejected {}
