use std::time::Duration;

use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "4.0";
const DRIVER_MIN_WIRE_VERSION: i32 = 7;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    #[display("RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    #[display("RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    #[display("RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    #[display("RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    #[serde(rename = "RSGhost")]
    #[display("RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the driver and the MongoDB deployment.
    LoadBalancer,

    /// A server that a secondary reported as primary but that has not been checked yet.
    PossiblePrimary,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether a server of this type is "available" in the server selection sense.
    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown | ServerType::PossiblePrimary)
    }
}

/// Struct modeling the `topologyVersion` field included in the server's hello and legacy hello
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyVersion {
    /// The unique id of the server process.
    pub process_id: ObjectId,

    /// A counter incremented on each role change within `process_id`.
    pub counter: i64,
}

impl TopologyVersion {
    /// Whether this version supersedes `existing`. Versions from another process always do.
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }

    /// Whether a description carrying this version must be discarded in favor of one carrying
    /// `existing`.
    pub(crate) fn is_stale_compared_to(&self, existing: TopologyVersion) -> bool {
        self.process_id == existing.process_id && self.counter < existing.counter
    }

    pub(crate) fn to_document(self) -> Document {
        doc! {
            "processId": self.process_id,
            "counter": self.counter,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) last_update_time: Option<DateTime>,
    pub(crate) average_round_trip_time: Option<Duration>,

    // A description either holds the most recent hello reply, the error from the most recent
    // heartbeat, or neither when the server was just added and has not been checked yet.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => {
                match (self_err.kind.as_ref(), other_err.kind.as_ref()) {
                    (ErrorKind::Command(self_command_err), ErrorKind::Command(other_command_err)) => {
                        self_command_err.code == other_command_err.code
                            && self_err.topology_version() == other_err.topology_version()
                    }
                    _ => true,
                }
            }
            _ => false,
        }
    }
}

impl ServerDescription {
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: ServerAddress {
                host: address.host.to_lowercase(),
                port: address.port,
            },
            server_type: Default::default(),
            last_update_time: None,
            reply: Ok(None),
            average_round_trip_time: None,
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.average_round_trip_time = Some(average_rtt);
        description.last_update_time = Some(DateTime::now());

        // Infer the server type from the hello response.
        description.server_type = reply.command_response.server_type();

        // Normalize all instances of hostnames to lowercase.
        let response = &mut reply.command_response;
        for list in [
            response.hosts.as_mut(),
            response.passives.as_mut(),
            response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = response.me {
            *me = me.to_lowercase();
        }
        if let Some(ref mut primary) = response.primary {
            *primary = primary.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// A placeholder for a server that a secondary reported as primary.
    pub(crate) fn new_possible_primary(address: &ServerAddress) -> Self {
        let mut description = Self::new(address);
        description.server_type = ServerType::PossiblePrimary;
        description
    }

    /// The description of the single load balancer in a load balanced topology. It is never
    /// monitored, so it is always considered available with zero latency.
    pub(crate) fn new_load_balancer(address: &ServerAddress) -> Self {
        let mut description = Self::new(address);
        description.server_type = ServerType::LoadBalancer;
        description.average_round_trip_time = Some(Duration::ZERO);
        description.last_update_time = Some(DateTime::now());
        description
    }

    /// Whether this server is a known, data-bearing or routing member that operations can use.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this client only supports up to \
                     {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this client requires at least {} \
                     (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION
                ));
            }
        }

        None
    }

    fn reply(&self) -> Result<Option<&HelloReply>> {
        self.reply
            .as_ref()
            .map(Option::as_ref)
            .map_err(Clone::clone)
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_name.clone()))
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let known_hosts = self.reply()?.map(|reply| {
            let hosts = reply.command_response.hosts.as_ref();
            let passives = reply.command_response.passives.as_ref();
            let arbiters = reply.command_response.arbiters.as_ref();

            hosts
                .into_iter()
                .flatten()
                .chain(passives.into_iter().flatten())
                .chain(arbiters.into_iter().flatten())
        });

        known_hosts
            .into_iter()
            .flatten()
            .map(ServerAddress::parse)
            .collect()
    }

    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply()? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.election_id))
    }

    pub(crate) fn primary(&self) -> Result<Option<ServerAddress>> {
        self.reply()?
            .and_then(|reply| reply.command_response.primary.as_ref())
            .map(ServerAddress::parse)
            .transpose()
    }

    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.min_wire_version))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.max_wire_version))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.last_write.as_ref())
            .map(|write| write.last_write_date))
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(None) => None,
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn hello_ok(&self) -> bool {
        matches!(self.reply(), Ok(Some(reply)) if reply.command_response.hello_ok == Some(true))
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        // The empty tag set matches every server, including servers with no tags at all.
        if tag_set.is_empty() {
            return true;
        }

        let server_tags = match self.reply.as_ref() {
            Ok(Some(reply)) => match reply.command_response.tags {
                Some(ref tags) => tags,
                None => return false,
            },
            _ => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}
