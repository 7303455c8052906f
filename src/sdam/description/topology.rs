pub(crate) mod server_selection;
#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    options::{ClientOptions, ServerAddress, DEFAULT_HEARTBEAT_FREQUENCY},
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
    },
};

use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl TopologyType {
    fn is_replica_set(self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }
}

/// A description of the most up-to-date information known about a topology. Each instance is an
/// immutable snapshot; changes produce a new description.
#[derive(Debug, Clone, Default)]
pub struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that is
    /// acceptable for a read operation.
    pub(crate) local_threshold: Option<Duration>,

    /// The maximum amount of time to wait before checking a given server by sending server check.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality only decides whether to publish a new description and wake up blocked
        // selections, so only the fields consulted by server selection matter.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut description = Self::default();
        description.initialize(options);
        description
    }

    fn initialize(&mut self, options: &ClientOptions) {
        self.topology_type = if let Some(true) = options.direct_connection {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.is_load_balanced() {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        for address in options.hosts.iter() {
            let description = if self.topology_type == TopologyType::LoadBalanced {
                ServerDescription::new_load_balancer(address)
            } else {
                ServerDescription::new(address)
            };
            self.servers.insert(address.to_owned(), description);
        }

        self.single_seed = self.servers.len() == 1;
        self.set_name.clone_from(&options.repl_set_name);
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    /// Gets the topology type of the cluster.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, once known.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The highest set version reported by a primary of this replica set.
    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    /// The highest election id reported by a primary of this replica set.
    pub fn max_election_id(&self) -> Option<ObjectId> {
        self.max_election_id
    }

    /// Describes why a member of the topology is incompatible with this client, if one is.
    pub fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// The servers in the topology, keyed by address.
    pub fn servers(&self) -> HashMap<&ServerAddress, ServerInfo<'_>> {
        self.servers
            .iter()
            .map(|(address, description)| (address, ServerInfo::new_borrowed(description)))
            .collect()
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// Gets the heartbeat frequency.
    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Records the first wire version incompatibility found among the servers, if any.
    fn check_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|server| server.compatibility_error_message());
    }

    /// Returns the diff between this topology description and the provided one, or `None` if
    /// they are equal.
    ///
    /// The returned `TopologyDescriptionDiff` refers to the changes reflected in the provided
    /// description. For example, if the provided description has a server in it that this
    /// description does not, it will be returned in the `added_addresses` field.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

    /// Applies a new description of one of the topology's servers. Descriptions of unknown
    /// addresses and descriptions older than the one already recorded are ignored.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        let existing = match self.servers.get(&server_description.address) {
            Some(existing) => existing,
            None => return Ok(()),
        };
        if let (Some(existing_version), Some(new_version)) = (
            existing.topology_version(),
            server_description.topology_version(),
        ) {
            if new_version.is_stale_compared_to(existing_version) {
                return Ok(());
            }
        }

        if self.topology_type == TopologyType::Single {
            if let Some(error) = self.set_name_mismatch(&server_description) {
                server_description =
                    ServerDescription::new_from_error(server_description.address, error);
            }
        }

        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        let transition = self.transition(server_description.server_type)?;
        match transition {
            Transition::Keep => {}
            Transition::Remove => {
                self.servers.remove(&server_description.address);
            }
            Transition::BecomeSharded => self.topology_type = TopologyType::Sharded,
            Transition::Standalone => {
                if self.single_seed {
                    self.topology_type = TopologyType::Single;
                } else {
                    self.servers.remove(&server_description.address);
                }
            }
            Transition::Primary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_from_primary(server_description)?;
            }
            Transition::MemberWithoutPrimary => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_from_member_without_primary(server_description)?;
            }
            Transition::MemberWithPrimary => {
                self.update_from_member_with_primary(server_description)?
            }
        }

        if matches!(transition, Transition::Keep | Transition::Remove)
            && self.topology_type.is_replica_set()
        {
            self.record_primary_state();
        }

        if self.topology_type != TopologyType::LoadBalanced {
            self.check_compatibility();
        }

        Ok(())
    }

    /// With a configured set name, a direct connection only accepts a server reporting that name.
    fn set_name_mismatch(&self, server_description: &ServerDescription) -> Option<Error> {
        let expected = self.set_name.as_ref()?;
        if !server_description.is_available() {
            return None;
        }

        let reported = match server_description.set_name() {
            Ok(Some(name)) if &name == expected => return None,
            Ok(Some(name)) => format!("{:?}", name),
            Ok(None) => "<none>".to_string(),
            Err(error) => format!("<error: {}>", error),
        };
        Some(Error::invalid_argument(format!(
            "replica set name {:?} does not match actual name {}",
            expected, reported
        )))
    }

    /// Looks up how a server of type `server_type` changes a topology of the current type.
    fn transition(&self, server_type: ServerType) -> Result<Transition> {
        let transition = match (self.topology_type, server_type) {
            (TopologyType::Single | TopologyType::LoadBalanced, _) => Transition::Keep,
            (_, ServerType::Unknown | ServerType::PossiblePrimary) => Transition::Keep,
            (TopologyType::Sharded, ServerType::Mongos) => Transition::Keep,
            (TopologyType::Sharded, _) => Transition::Remove,
            (_, ServerType::LoadBalancer) => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
            (_, ServerType::RsGhost) => Transition::Keep,
            (TopologyType::Unknown, ServerType::Standalone) => Transition::Standalone,
            (TopologyType::Unknown, ServerType::Mongos) => Transition::BecomeSharded,
            (_, ServerType::Standalone | ServerType::Mongos) => Transition::Remove,
            (_, ServerType::RsPrimary) => Transition::Primary,
            (TopologyType::ReplicaSetWithPrimary, _) => Transition::MemberWithPrimary,
            (_, _) => Transition::MemberWithoutPrimary,
        };
        Ok(transition)
    }

    /// Records the set name reported by `server_description` if none is known yet. Returns
    /// whether the server belongs to the set.
    fn accept_set_name(&mut self, server_description: &ServerDescription) -> Result<bool> {
        let reported = server_description.set_name()?;
        match self.set_name {
            None => {
                self.set_name = reported;
                Ok(true)
            }
            Some(ref expected) => Ok(reported.as_ref() == Some(expected)),
        }
    }

    fn update_from_member_without_primary(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if !self.accept_set_name(&server_description)? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        // The member's view of the primary is worth checking right away.
        if let Some(primary) = server_description.primary()? {
            if let Some(description) = self.servers.get_mut(&primary) {
                if description.server_type == ServerType::Unknown {
                    *description = ServerDescription::new_possible_primary(&primary);
                }
            }
        }

        Ok(())
    }

    fn update_from_member_with_primary(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? || server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }
        self.record_primary_state();
        Ok(())
    }

    fn update_from_primary(&mut self, server_description: ServerDescription) -> Result<()> {
        if !self.accept_set_name(&server_description)? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        let set_version = server_description.set_version()?;
        let election_id = server_description.election_id()?;
        if self.is_stale_primary(set_version, election_id) {
            // Replaced with an unknown description so that it gets checked again.
            self.servers.insert(
                server_description.address.clone(),
                ServerDescription::new(&server_description.address),
            );
            self.record_primary_state();
            return Ok(());
        }

        if let (Some(_), Some(election_id)) = (set_version, election_id) {
            self.max_election_id = Some(election_id);
        }
        if let Some(set_version) = set_version {
            if self.max_set_version.is_none_or(|max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        // At most one primary: any other is reset to unknown and will be checked again.
        for (address, description) in self.servers.iter_mut() {
            if *address != server_description.address
                && description.server_type == ServerType::RsPrimary
            {
                *description = ServerDescription::new(address);
            }
        }

        // The primary's member list is authoritative.
        let members = server_description.known_hosts()?;
        self.servers.retain(|address, _| members.contains(address));
        self.add_new_servers(members);

        self.record_primary_state();

        Ok(())
    }

    /// Whether a primary reporting `set_version` and `election_id` is older than the newest
    /// primary already seen.
    fn is_stale_primary(&self, set_version: Option<i32>, election_id: Option<ObjectId>) -> bool {
        match (
            set_version,
            election_id,
            self.max_set_version,
            self.max_election_id,
        ) {
            (Some(set_version), Some(election_id), Some(max_set_version), Some(max_election_id)) => {
                (max_set_version, max_election_id) > (set_version, election_id)
            }
            _ => false,
        }
    }

    /// Sets the replica set type according to whether a primary is known.
    fn record_primary_state(&mut self) {
        debug_assert!(self.topology_type.is_replica_set());
        let has_primary = self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Adds an unknown description for every address not yet in the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            if !self.servers.contains_key(&address) {
                let description = ServerDescription::new(&address);
                self.servers.insert(address, description);
            }
        }
    }
}

/// How a new server description changes the topology around it.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Transition {
    /// Only the server's own description changes.
    Keep,
    /// The server does not belong in the topology.
    Remove,
    BecomeSharded,
    /// A standalone is only accepted as the sole seed.
    Standalone,
    Primary,
    MemberWithoutPrimary,
    MemberWithPrimary,
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = vec![format!("Type: {}", self.topology_type)];
        if let Some(ref set_name) = self.set_name {
            fields.push(format!("Set Name: {}", set_name));
        }
        if let Some(max_set_version) = self.max_set_version {
            fields.push(format!("Max Set Version: {}", max_set_version));
        }
        if let Some(max_election_id) = self.max_election_id {
            fields.push(format!("Max Election ID: {}", max_election_id));
        }
        if let Some(ref compatibility_error) = self.compatibility_error {
            fields.push(format!("Compatibility Error: {}", compatibility_error));
        }
        if !self.servers.is_empty() {
            let servers: Vec<String> = self
                .servers
                .values()
                .map(|server| ServerInfo::new_borrowed(server).to_string())
                .collect();
            fields.push(format!("Servers: [ {} ]", servers.join(", ")));
        }

        write!(f, "{{ {} }}", fields.join(", "))
    }
}

pub(crate) fn choose_n<T>(values: &[T], n: usize) -> impl Iterator<Item = &T> {
    use rand::{rngs::SmallRng, seq::IndexedRandom, SeedableRng};
    values.choose_multiple(&mut SmallRng::from_os_rng(), n)
}

/// A struct representing the diff between two `TopologyDescription`s.
/// Returned from `TopologyDescription::diff`.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}
