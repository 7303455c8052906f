//! Error types shared by every part of the crate.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyVersion};

/// Server error codes meaning "node is recovering".
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
/// Server error codes meaning "not writable primary".
const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
/// Recovering codes that also mean the server process is exiting.
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

/// Shorthand for results carrying this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by monitoring, selection or pooling, along with its labels and the error
/// that caused it.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// Boxed to keep `Result` small.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.into_iter().flatten().collect(),
            source: None,
        }
    }

    fn pool_unavailable(message: String) -> Self {
        ErrorKind::ConnectionPoolCleared { message }.into()
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        Self::pool_unavailable(format!(
            "Connection pool for {} cleared because another operation failed with: {}",
            address, cause
        ))
        .with_source(cause.clone())
    }

    pub(crate) fn pool_paused_error(address: &ServerAddress) -> Self {
        Self::pool_unavailable(format!(
            "Connection pool for {} is paused until the server is successfully checked",
            address
        ))
    }

    pub(crate) fn pool_closed_error(address: &ServerAddress) -> Self {
        Self::pool_unavailable(format!("Connection pool for {} was closed", address))
    }

    /// For [`Authenticator`](crate::transport::Authenticator) implementations to report a
    /// failed conversation.
    pub fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection(message: impl Into<String>) -> Error {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn incompatible_server(message: impl Into<String>) -> Error {
        ErrorKind::IncompatibleServer {
            message: message.into(),
        }
        .into()
    }

    #[cfg(test)]
    pub(crate) fn network_timeout() -> Error {
        std::io::ErrorKind::TimedOut.into()
    }

    pub(crate) fn with_source(mut self, source: impl Into<Option<Error>>) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// Labels attached by the server or by this crate, such as `RetryableWriteError`.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    #[allow(missing_docs)]
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    #[allow(missing_docs)]
    pub fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self.kind.as_ref() {
            ErrorKind::Io(error) => Some(error.kind()),
            _ => None,
        }
    }

    /// I/O failures count, and so do pool-cleared errors, since pools are cleared after them.
    pub fn is_network_error(&self) -> bool {
        self.io_kind().is_some() || self.is_pool_cleared()
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.io_kind()
            .is_some_and(|kind| kind != std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        self.io_kind() == Some(std::io::ErrorKind::TimedOut)
    }

    /// No server was selected in time, or the selected server's pool refused the checkout.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. }) || self.is_pool_cleared()
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// The server error code, looked up through the source chain when this error has none.
    pub fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => self.source.as_ref()?.sdam_code(),
        }
    }

    fn has_code_in(&self, codes: &[i32]) -> bool {
        self.sdam_code().is_some_and(|code| codes.contains(&code))
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.has_code_in(&NOT_WRITABLE_PRIMARY_CODES)
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.has_code_in(&RECOVERING_CODES)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.has_code_in(&SHUTTING_DOWN_CODES)
    }

    /// The server answered, but can no longer serve in the role it was selected for, such as a
    /// primary that stepped down.
    pub fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// The topology version the server attached to an error reply.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => command_error.topology_version,
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while attempting to authenticate a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(#[from] bson::de::Error),

    /// The server returned an error to an attempted command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The connection pool for a server was cleared or closed, causing the checkout to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// A server in the topology does not support the wire versions this client supports.
    #[error("{message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The server returned an invalid reply.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// No server satisfying the selection criteria could be found before the deadline.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A checkout waited longer than its deadline or the pool's `wait_queue_timeout`.
    #[error(
        "Timed out while checking out a connection from connection pool with address {address}"
    )]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The topology was shut down while an operation was in progress.
    #[error("Topology closed")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The topology version reported by the server in the error response.
    #[serde(rename = "topologyVersion")]
    pub topology_version: Option<TopologyVersion>,
}

impl CommandError {
    /// Constructs a command error with the given code and message.
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            topology_version: None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_change_classification() {
        let not_primary: Error = ErrorKind::Command(CommandError::new(
            10107,
            "NotWritablePrimary",
            "not primary",
        ))
        .into();
        assert!(not_primary.is_state_change_error());
        assert!(!not_primary.is_shutting_down());

        let shutting_down: Error = ErrorKind::Command(CommandError::new(
            91,
            "ShutdownInProgress",
            "shutting down",
        ))
        .into();
        assert!(shutting_down.is_state_change_error());
        assert!(shutting_down.is_shutting_down());

        let other: Error = ErrorKind::Command(CommandError::new(2, "BadValue", "bad")).into();
        assert!(!other.is_state_change_error());
    }

    #[test]
    fn network_classification() {
        let timeout = Error::network_timeout();
        assert!(timeout.is_network_error());
        assert!(timeout.is_network_timeout());
        assert!(!timeout.is_non_timeout_network_error());

        let reset: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_non_timeout_network_error());

        let address = ServerAddress::parse("a:27017").unwrap();
        let cleared = Error::pool_cleared_error(&address, &reset);
        assert!(cleared.is_network_error());
        assert!(cleared.is_server_selection_error());
    }

    #[test]
    fn labels() {
        let mut error = Error::internal("oops");
        assert!(!error.contains_label("TransientTransactionError"));
        error.add_label("TransientTransactionError");
        assert!(error.contains_label("TransientTransactionError"));
    }
}
