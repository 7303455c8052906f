//! The `hello` handshake and monitoring command, and the replies servers send to it.

use std::time::Duration;

use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::{
    cmap::Connection,
    error::Result,
    options::{ServerAddress, ServerApi},
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
    transport::Command,
};

/// Name of the pre-5.0 handshake command, still understood by every supported server.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Turns a hello into a streaming one: the server holds the reply until its topology version
/// moves past `topology_version` or `max_await_time` elapses.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Builds the handshake or heartbeat command.
///
/// Servers that declared an API version, sit behind a load balancer, or already answered with
/// `helloOk: true` get `hello`. Everyone else gets the legacy command, which asks for `helloOk`
/// until the server has answered once.
pub(crate) fn hello_command(
    server_api: Option<&ServerApi>,
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let load_balanced = load_balanced == Some(true);
    let use_hello = server_api.is_some() || load_balanced || hello_ok == Some(true);

    let command_name = if use_hello {
        "hello"
    } else {
        LEGACY_HELLO_COMMAND_NAME
    };
    let mut body = doc! { command_name: 1 };
    if !use_hello && hello_ok.is_none() {
        body.insert("helloOk", true);
    }
    if load_balanced {
        body.insert("loadBalanced", true);
    }

    if let Some(AwaitableHelloOptions {
        topology_version,
        max_await_time,
    }) = awaitable_options
    {
        let max_await_ms = i64::try_from(max_await_time.as_millis()).unwrap_or(i64::MAX);
        body.insert("topologyVersion", topology_version.to_document());
        body.insert("maxAwaitTimeMS", max_await_ms);
    }

    if let Some(server_api) = server_api {
        server_api.append_to(&mut body);
    }

    Command::new(command_name, "admin", body)
}

/// Sends `command` on `conn` and parses the reply. Error replies have already been turned into
/// errors by the connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let raw_command_response = conn.send_command(command).await?;
    Ok(HelloReply {
        server_address: conn.address().clone(),
        command_response: bson::from_document(raw_command_response.clone())?,
        raw_command_response,
    })
}

/// A parsed hello reply and the server that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

impl HelloReply {
    /// The fields monitoring uses.
    pub fn command_response(&self) -> &HelloCommandResponse {
        &self.command_response
    }

    /// The reply exactly as the server sent it.
    pub fn raw_command_response(&self) -> &Document {
        &self.raw_command_response
    }
}

/// The fields of a hello reply that discovery and monitoring look at. Anything else the server
/// sends is only kept in [`HelloReply::raw_command_response`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HelloCommandResponse {
    /// Set by primaries, standalones and mongos.
    pub is_writable_primary: Option<bool>,

    /// `is_writable_primary` as spelled in legacy hello replies.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// The server accepts `hello` in place of the legacy command.
    pub hello_ok: Option<bool>,

    pub hosts: Option<Vec<String>>,

    pub passives: Option<Vec<String>>,

    pub arbiters: Option<Vec<String>>,

    /// `"isdbgrid"` when the server is a mongos.
    pub msg: Option<String>,

    /// The server's own address as the replica set config names it.
    pub me: Option<String>,

    pub set_version: Option<i32>,

    pub set_name: Option<String>,

    pub hidden: Option<bool>,

    pub secondary: Option<bool>,

    pub arbiter_only: Option<bool>,

    /// Set by a replica set member that has not been initiated or added to a config yet.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    pub logical_session_timeout_minutes: Option<i64>,

    pub last_write: Option<LastWrite>,

    pub min_wire_version: Option<i32>,

    pub max_wire_version: Option<i32>,

    pub tags: Option<TagSet>,

    pub election_id: Option<ObjectId>,

    /// Who this member believes the primary is.
    pub primary: Option<String>,

    pub sasl_supported_mechs: Option<Vec<String>>,

    /// Identifies the backend a load balancer routed the connection to.
    pub service_id: Option<ObjectId>,

    pub topology_version: Option<TopologyVersion>,

    /// The server-side id of the connection the command ran on.
    pub connection_id: Option<i64>,
}

impl HelloCommandResponse {
    fn is_primary(&self) -> bool {
        self.is_writable_primary == Some(true) || self.is_master == Some(true)
    }

    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }
        if self.set_name.is_none() {
            return match self.is_replica_set {
                Some(true) => ServerType::RsGhost,
                _ => ServerType::Standalone,
            };
        }
        match (self.hidden, self.secondary, self.arbiter_only) {
            (Some(true), _, _) => ServerType::RsOther,
            _ if self.is_primary() => ServerType::RsPrimary,
            (_, Some(true), _) => ServerType::RsSecondary,
            (_, _, Some(true)) => ServerType::RsArbiter,
            _ => ServerType::RsOther,
        }
    }
}

/// The `lastWrite` subdocument of a replica set member's hello reply.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct LastWrite {
    /// Wall-clock time of the member's most recent write.
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn legacy_hello_negotiates_hello_ok() {
        let command = hello_command(None, None, None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(command.body.get_bool("helloOk"), Ok(true));

        let command = hello_command(None, None, Some(true), None);
        assert_eq!(command.name, "hello");
        assert!(command.body.get("helloOk").is_none());

        let command = hello_command(None, Some(true), None, None);
        assert_eq!(command.name, "hello");
        assert_eq!(command.body.get_bool("loadBalanced"), Ok(true));
    }

    #[test]
    fn awaitable_hello_includes_topology_version() {
        let topology_version = TopologyVersion {
            process_id: ObjectId::new(),
            counter: 3,
        };
        let command = hello_command(
            None,
            None,
            Some(true),
            Some(AwaitableHelloOptions {
                topology_version,
                max_await_time: Duration::from_secs(10),
            }),
        );
        assert_eq!(command.body.get_i64("maxAwaitTimeMS"), Ok(10_000));
        assert_eq!(
            command.body.get_document("topologyVersion").unwrap(),
            &topology_version.to_document()
        );
    }

    #[test]
    fn server_type_inference() {
        let parse = |doc: Document| -> ServerType {
            bson::from_document::<HelloCommandResponse>(doc)
                .unwrap()
                .server_type()
        };

        assert_eq!(parse(doc! { "msg": "isdbgrid" }), ServerType::Mongos);
        assert_eq!(
            parse(doc! { "setName": "rs", "isWritablePrimary": true }),
            ServerType::RsPrimary
        );
        assert_eq!(
            parse(doc! { "setName": "rs", "ismaster": true, "hidden": true }),
            ServerType::RsOther
        );
        assert_eq!(
            parse(doc! { "setName": "rs", "secondary": true }),
            ServerType::RsSecondary
        );
        assert_eq!(
            parse(doc! { "setName": "rs", "arbiterOnly": true }),
            ServerType::RsArbiter
        );
        assert_eq!(parse(doc! { "isreplicaset": true }), ServerType::RsGhost);
        assert_eq!(parse(doc! { "ismaster": true }), ServerType::Standalone);
    }
}
