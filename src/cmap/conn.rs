pub(crate) mod pooled;

use std::{collections::HashMap, time::Instant};

use bson::{oid::ObjectId, Bson, Document};
use derive_where::derive_where;

use super::{worker::PoolGeneration, CmapEventEmitter};
use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    event::cmap::ConnectionCreatedEvent,
    hello::HelloReply,
    options::ServerAddress,
    transport::{Command, CommandStream},
};

/// A channel to a server, along with what was learned about the server while handshaking it.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection, unique within its pool.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    pub(crate) time_created: Instant,

    /// The reply to the initial handshake. Unset until the handshake completes.
    pub(crate) hello_reply: Option<HelloReply>,

    /// The most recent network error encountered on this connection, if any. A connection that
    /// has errored is closed instead of being returned to its pool.
    pub(crate) error: Option<Error>,

    /// Whether a command is in flight. A connection dropped mid-command cannot be reused
    /// because its reply would be read by the next user.
    command_executing: bool,

    #[derive_where(skip)]
    stream: Option<Box<dyn CommandStream>>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: Box<dyn CommandStream>,
        id: u32,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            address,
            time_created,
            hello_reply: None,
            error: None,
            command_executing: false,
            stream: Some(stream),
        }
    }

    /// The pool-scoped ID of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Sends a command and returns the server's reply.
    ///
    /// Replies with `ok: 0` are converted into [`ErrorKind::Command`] errors carrying the
    /// reply's error labels. Network errors are recorded so the connection is discarded when it
    /// is returned to its pool.
    pub async fn send_command(&mut self, command: Command) -> Result<Document> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(Error::internal(format!(
                    "connection {} to {} is no longer usable",
                    self.id, self.address
                )))
            }
        };

        self.command_executing = true;
        let result = stream.send_command(command).await;
        self.command_executing = false;

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                if error.is_network_error() {
                    self.error = Some(error.clone());
                }
                return Err(error);
            }
        };

        if reply_is_ok(&reply) {
            return Ok(reply);
        }

        let labels: Option<Vec<String>> = reply.get_array("errorLabels").ok().map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.as_str().map(String::from))
                .collect()
        });
        let command_error: CommandError = bson::from_document(reply)?;
        Err(Error::new(ErrorKind::Command(command_error), labels))
    }

    /// The highest wire version the server reported during the handshake.
    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.hello_reply
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version)
    }

    /// The service ID for this connection. Only set if this connection is to a load balancer.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.hello_reply
            .as_ref()
            .and_then(|reply| reply.command_response.service_id)
    }

    /// The server-side ID of this connection, if the server reported one.
    pub(crate) fn server_connection_id(&self) -> Option<i64> {
        self.hello_reply
            .as_ref()
            .and_then(|reply| reply.command_response.connection_id)
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Moves the state out of this connection, leaving it unusable.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            id: self.id,
            address: self.address.clone(),
            time_created: self.time_created,
            hello_reply: self.hello_reply.take(),
            error: self.error.take(),
            command_executing: self.command_executing,
            stream: self.stream.take(),
        }
    }
}

fn reply_is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok == 1.0,
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

/// The generation of a connection, compared against its pool's to detect stale connections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConnectionGeneration {
    Normal(u32),
    LoadBalanced(Option<LoadBalancedGeneration>),
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::Normal(_) => None,
            ConnectionGeneration::LoadBalanced(generation) => generation.map(|g| g.service_id),
        }
    }

    pub(crate) fn is_stale(self, current_generation: &PoolGeneration) -> bool {
        match (self, current_generation) {
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != *pgen,
            (ConnectionGeneration::LoadBalanced(Some(lb)), PoolGeneration::LoadBalanced(map)) => {
                lb.generation != generation_for_service(map, &lb.service_id)
            }
            _ => true,
        }
    }
}

impl From<LoadBalancedGeneration> for ConnectionGeneration {
    fn from(generation: LoadBalancedGeneration) -> Self {
        ConnectionGeneration::LoadBalanced(Some(generation))
    }
}

pub(crate) fn generation_for_service(map: &HashMap<ObjectId, u32>, service_id: &ObjectId) -> u32 {
    map.get(service_id).copied().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LoadBalancedGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: ObjectId,
}

/// A connection that has been assigned an ID but has not yet been connected and handshaked.
#[derive(Clone)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    pub(crate) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}
