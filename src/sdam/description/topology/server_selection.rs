#[cfg(test)]
mod test;

use std::{collections::HashMap, fmt::Write, ops::Deref, sync::Arc, time::Duration};

use bson::DateTime;

use super::TopologyDescription;
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Estimates how far a secondary lags behind the rest of its replica set. Used to enforce
/// `max_staleness` during server selection.
pub trait StalenessEstimator: Send + Sync {
    /// Estimates the staleness of `secondary`.
    ///
    /// `primary` is the current primary, if one is known. Otherwise
    /// `max_secondary_last_write_date` holds the most recent write date reported by any
    /// secondary. Returns `None` if the staleness cannot be estimated, which makes the secondary
    /// ineligible.
    fn estimate(
        &self,
        secondary: &ServerInfo<'_>,
        primary: Option<&ServerInfo<'_>>,
        max_secondary_last_write_date: Option<DateTime>,
        heartbeat_frequency: Duration,
    ) -> Option<Duration>;
}

/// Estimates staleness from the last write dates reported in heartbeats.
///
/// With a primary P and secondary S:
/// `(S.lastUpdateTime - S.lastWriteDate) - (P.lastUpdateTime - P.lastWriteDate) + heartbeat`.
///
/// Without a primary, where SMax is the secondary with the most recent write:
/// `SMax.lastWriteDate - S.lastWriteDate + heartbeat`.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct DefaultStalenessEstimator;

impl StalenessEstimator for DefaultStalenessEstimator {
    fn estimate(
        &self,
        secondary: &ServerInfo<'_>,
        primary: Option<&ServerInfo<'_>>,
        max_secondary_last_write_date: Option<DateTime>,
        heartbeat_frequency: Duration,
    ) -> Option<Duration> {
        let heartbeat_frequency: i64 = heartbeat_frequency
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);
        let secondary_last_write = secondary.last_write_date()?.timestamp_millis();

        let staleness = match primary {
            Some(primary) => {
                let primary_last_update = primary.last_update_time()?.timestamp_millis();
                let primary_last_write = primary.last_write_date()?.timestamp_millis();
                let secondary_last_update = secondary.last_update_time()?.timestamp_millis();

                (secondary_last_update - secondary_last_write)
                    - (primary_last_update - primary_last_write)
                    + heartbeat_frequency
            }
            None => {
                max_secondary_last_write_date?.timestamp_millis() - secondary_last_write
                    + heartbeat_frequency
            }
        };

        Some(Duration::from_millis(staleness.max(0) as u64))
    }
}

/// A server chosen by selection. The server's operation count includes this value until it is
/// dropped.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        server.begin_operation();
        Self { server }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.end_operation();
    }
}

/// Attempt to select a server, returning None if no server could be selected
/// that matched the provided criteria.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
    staleness_estimator: &dyn StalenessEstimator,
) -> Result<Option<SelectedServer>> {
    let mut in_window =
        topology_description.suitable_servers_in_latency_window(criteria, staleness_estimator)?;
    if let Some(addr) = deprioritized {
        if topology_description.topology_type == TopologyType::Sharded && in_window.len() > 1 {
            in_window.retain(|d| &d.address != addr);
        }
    }
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|desc| servers.get(&desc.address))
        .collect();
    let selected = select_server_in_latency_window(in_window_servers);
    Ok(selected.map(SelectedServer::new))
}

/// Choose a server from several suitable choices within the latency window. Two candidates are
/// drawn at random and the one with fewer operations in progress wins.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    } else if in_window.len() == 1 {
        return Some(in_window[0].clone());
    }

    super::choose_n(&in_window, 2)
        .min_by_key(|s| s.operation_count())
        .map(|server| (*server).clone())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> String {
        if !self.has_available_servers() {
            return format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            );
        }

        let mut message = format!(
            "Server selection timeout: None of the available servers suitable for criteria {}.",
            criteria
        );
        let reasons = self.rejection_reasons(criteria, staleness_estimator);
        if !reasons.is_empty() {
            message.push_str(" Rejected servers: [");
            let mut first = true;
            for (address, reason) in reasons {
                let separator = if first { " " } else { ", " };
                first = false;
                let _ = write!(message, "{}{}: {}", separator, address, reason);
            }
            message.push_str(" ].");
        }
        let _ = write!(message, " Topology: {}", self);
        message
    }

    /// Explains, per server, why it could not be chosen for the given criteria.
    fn rejection_reasons(
        &self,
        criteria: &SelectionCriteria,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> Vec<(&ServerAddress, String)> {
        let suitable: Vec<&ServerAddress> = self
            .suitable_servers_in_latency_window(criteria, staleness_estimator)
            .map(|servers| servers.into_iter().map(|s| &s.address).collect())
            .unwrap_or_default();

        let mut reasons: Vec<_> = self
            .servers
            .iter()
            .filter(|(address, _)| !suitable.contains(address))
            .map(|(address, server)| {
                let reason = if !server.is_available() {
                    match server.reply {
                        Err(ref e) => format!("unavailable ({}: {})", server.server_type, e),
                        Ok(_) => format!("unavailable ({})", server.server_type),
                    }
                } else {
                    match criteria {
                        SelectionCriteria::ReadPreference(read_pref) => format!(
                            "server type {} does not satisfy read preference {}",
                            server.server_type, read_pref
                        ),
                        SelectionCriteria::Predicate(_) => {
                            format!("server type {} rejected by predicate", server.server_type)
                        }
                    }
                };
                (address, reason)
            })
            .collect();
        reasons.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        reasons
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(Error::incompatible_server(message.to_string()));
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => {
                self.suitable_servers(read_pref, staleness_estimator)?
            }
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // If we're direct-connected or connected to a standalone, ignore whether the
                    // single server in the topology is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self
                .servers
                .values()
                .filter(|s| s.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference, staleness_estimator)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // The load balancer is never monitored, so it is always selectable.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();
        let secondaries = |types: &'static [ServerType]| {
            self.suitable_servers_for_read_preference(
                types,
                tag_sets,
                max_staleness,
                staleness_estimator,
            )
        };

        let servers = match read_preference {
            ReadPreference::Primary => self.primary().into_iter().collect(),
            ReadPreference::Secondary { .. } => secondaries(&[ServerType::RsSecondary])?,
            ReadPreference::PrimaryPreferred { .. } => match self.primary() {
                Some(primary) => vec![primary],
                None => secondaries(&[ServerType::RsSecondary])?,
            },
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = secondaries(&[ServerType::RsSecondary])?;

                if suitable_servers.is_empty() {
                    self.primary().into_iter().collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => {
                secondaries(&[ServerType::RsPrimary, ServerType::RsSecondary])?
            }
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
        staleness_estimator: &dyn StalenessEstimator,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // A max staleness of zero is the same as no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(
                    &mut servers,
                    max_staleness,
                    staleness_estimator,
                );
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
        staleness_estimator: &dyn StalenessEstimator,
    ) {
        let primary = self.primary().map(ServerInfo::new_borrowed);
        let max_secondary_last_write_date = if primary.is_none() {
            let max_write_date = self
                .servers_with_type(&[ServerType::RsSecondary])
                .filter_map(|server| server.last_write_date().ok().flatten())
                .max();
            match max_write_date {
                Some(max_write_date) => Some(max_write_date),
                None => return,
            }
        } else {
            None
        };
        let heartbeat_frequency = self.heartbeat_frequency();

        servers.retain(|server| {
            // The staleness of the primary is always zero.
            if server.server_type == ServerType::RsPrimary {
                return true;
            }

            staleness_estimator
                .estimate(
                    &ServerInfo::new_borrowed(server),
                    primary.as_ref(),
                    max_secondary_last_write_date,
                    heartbeat_frequency,
                )
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
