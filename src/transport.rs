//! The narrow interfaces through which this crate reaches the network. Wire-level encoding and
//! authentication mechanisms live behind these traits.

use std::fmt;

use bson::Document;
use futures_util::future::BoxFuture;

use crate::{
    cmap::Connection,
    error::Result,
    hello::HelloReply,
    options::{Credential, ServerAddress},
};

/// A database command addressed to a particular database.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Command {
    /// The name of the command, which is also the first key of `body`.
    pub name: String,

    /// The database the command runs against.
    pub target_db: String,

    /// The full command document.
    pub body: Document,
}

impl Command {
    /// Constructs a new command.
    pub fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.name, self.target_db)
    }
}

/// An open channel to a single server that can run commands.
pub trait CommandStream: Send + 'static {
    /// Sends `command` and waits for the server's reply document. Replies with `ok: 0` are
    /// returned as-is; the caller classifies them.
    fn send_command(&mut self, command: Command) -> BoxFuture<'_, Result<Document>>;
}

/// Opens new channels to servers.
pub trait Transport: Send + Sync + 'static {
    /// Opens a channel to the given server. Handshaking is done by the caller.
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn CommandStream>>>;
}

/// Authenticates freshly handshaked connections.
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticates `connection` using `credential`. `hello` is the reply to the connection's
    /// initial handshake, e.g. for `saslSupportedMechs` negotiation.
    fn authenticate<'a>(
        &'a self,
        connection: &'a mut Connection,
        credential: &'a Credential,
        hello: &'a HelloReply,
    ) -> BoxFuture<'a, Result<()>>;
}
