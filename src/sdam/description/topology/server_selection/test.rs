use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, DateTime};
use pretty_assertions::assert_eq;
use serde::Deserialize;

use super::{attempt_to_select_server, DefaultStalenessEstimator, StalenessEstimator};
use crate::{
    error::ErrorKind,
    options::ServerAddress,
    sdam::{
        description::{
            server::ServerDescription,
            topology::{
                test::{address, f64_ms_as_duration, hello_response, server_description_with_rtt},
                TopologyDescription,
                TopologyType,
            },
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TestFile {
    #[serde(rename = "heartbeatFrequencyMS")]
    heartbeat_frequency_ms: Option<u64>,
    topology_description: TestTopologyDescription,
    read_preference: ReadPreference,
    #[serde(default)]
    suitable_servers: Vec<String>,
    #[serde(default)]
    in_latency_window: Vec<String>,
    #[serde(default)]
    error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TestTopologyDescription {
    #[serde(rename = "type")]
    topology_type: TopologyType,
    servers: Vec<TestServerDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TestServerDescription {
    address: String,
    #[serde(rename = "avg_rtt_ms")]
    avg_rtt_ms: Option<f64>,
    #[serde(rename = "type")]
    server_type: TestServerType,
    tags: Option<TagSet>,
    last_update_time: Option<i64>,
    #[serde(rename = "lastWriteMS")]
    last_write_ms: Option<i64>,
    max_wire_version: Option<i32>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
enum TestServerType {
    Standalone,
    Mongos,
    #[serde(rename = "RSPrimary")]
    RsPrimary,
    #[serde(rename = "RSSecondary")]
    RsSecondary,
    #[serde(rename = "RSArbiter")]
    RsArbiter,
    #[serde(rename = "RSOther")]
    RsOther,
    #[serde(rename = "RSGhost")]
    RsGhost,
    Unknown,
    PossiblePrimary,
}

impl TestServerDescription {
    fn into_server_description(self) -> ServerDescription {
        let mut response = match self.server_type {
            TestServerType::Unknown => return ServerDescription::new(&address(&self.address)),
            TestServerType::PossiblePrimary => {
                return ServerDescription::new_possible_primary(&address(&self.address))
            }
            TestServerType::Standalone => doc! {},
            TestServerType::Mongos => doc! { "msg": "isdbgrid" },
            TestServerType::RsPrimary => doc! { "setName": "rs", "isWritablePrimary": true },
            TestServerType::RsSecondary => doc! { "setName": "rs", "secondary": true },
            TestServerType::RsArbiter => doc! { "setName": "rs", "arbiterOnly": true },
            TestServerType::RsOther => doc! { "setName": "rs", "hidden": true },
            TestServerType::RsGhost => doc! { "isreplicaset": true },
        };
        if let Some(tags) = self.tags {
            let tags: bson::Document = tags
                .into_iter()
                .map(|(k, v)| (k, bson::Bson::String(v)))
                .collect();
            response.insert("tags", tags);
        }
        if let Some(last_write) = self.last_write_ms {
            response.insert(
                "lastWrite",
                doc! { "lastWriteDate": DateTime::from_millis(last_write) },
            );
        }
        if let Some(max_wire_version) = self.max_wire_version {
            response.insert("maxWireVersion", max_wire_version);
        }

        let rtt = f64_ms_as_duration(self.avg_rtt_ms.unwrap_or(0.0));
        let mut description =
            server_description_with_rtt(&self.address, hello_response(response), rtt);
        if let Some(last_update_time) = self.last_update_time {
            description.last_update_time = Some(DateTime::from_millis(last_update_time));
        }
        description
    }
}

fn sorted(servers: Vec<&ServerDescription>) -> Vec<String> {
    let mut addresses: Vec<_> = servers.into_iter().map(|s| s.address.to_string()).collect();
    addresses.sort();
    addresses
}

fn run_test(name: &str, scenario: serde_json::Value) {
    let test_file: TestFile = serde_json::from_value(scenario)
        .unwrap_or_else(|e| panic!("{}: invalid scenario: {}", name, e));

    let mut topology = TopologyDescription {
        topology_type: test_file.topology_description.topology_type,
        heartbeat_freq: test_file.heartbeat_frequency_ms.map(Duration::from_millis),
        ..Default::default()
    };
    for server in test_file.topology_description.servers {
        let server = server.into_server_description();
        topology.servers.insert(server.address.clone(), server);
    }
    topology.check_compatibility();

    let criteria = SelectionCriteria::ReadPreference(test_file.read_preference.clone());

    if test_file.error {
        assert!(
            topology
                .suitable_servers_in_latency_window(&criteria, &DefaultStalenessEstimator)
                .is_err(),
            "{}: expected selection to fail",
            name
        );
        return;
    }

    let suitable = topology
        .suitable_servers(&test_file.read_preference, &DefaultStalenessEstimator)
        .unwrap_or_else(|e| panic!("{}: {}", name, e));
    let mut expected_suitable = test_file.suitable_servers.clone();
    expected_suitable.sort();
    assert_eq!(sorted(suitable), expected_suitable, "{}: suitable", name);

    let in_window = topology
        .suitable_servers_in_latency_window(&criteria, &DefaultStalenessEstimator)
        .unwrap_or_else(|e| panic!("{}: {}", name, e));
    let mut expected_in_window = test_file.in_latency_window.clone();
    expected_in_window.sort();
    assert_eq!(sorted(in_window), expected_in_window, "{}: in window", name);
}

#[test]
fn read_preference_scenarios() {
    let scenarios = [
        (
            "nearest keeps servers within the local threshold",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary" },
                        { "address": "b:27017", "avg_rtt_ms": 8, "type": "RSSecondary" },
                        { "address": "c:27017", "avg_rtt_ms": 40, "type": "RSSecondary" },
                    ],
                },
                "readPreference": { "mode": "Nearest" },
                "suitableServers": ["a:27017", "b:27017", "c:27017"],
                "inLatencyWindow": ["a:27017", "b:27017"],
            }),
        ),
        (
            "primary read preference only matches the primary",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 50, "type": "RSPrimary" },
                        { "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary" },
                    ],
                },
                "readPreference": { "mode": "Primary" },
                "suitableServers": ["a:27017"],
                "inLatencyWindow": ["a:27017"],
            }),
        ),
        (
            "first tag set with a match wins",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary" },
                        {
                            "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "tags": { "dc": "ny" },
                        },
                        {
                            "address": "c:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "tags": { "dc": "sf", "rack": "1" },
                        },
                    ],
                },
                "readPreference": {
                    "mode": "Secondary",
                    "tagSets": [{ "dc": "la" }, { "dc": "sf" }, { "dc": "ny" }],
                },
                "suitableServers": ["c:27017"],
                "inLatencyWindow": ["c:27017"],
            }),
        ),
        (
            "empty tag set matches every secondary",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetNoPrimary",
                    "servers": [
                        {
                            "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "tags": { "dc": "ny" },
                        },
                        { "address": "c:27017", "avg_rtt_ms": 5, "type": "RSSecondary" },
                    ],
                },
                "readPreference": { "mode": "Secondary", "tagSets": [{ "dc": "la" }, {}] },
                "suitableServers": ["b:27017", "c:27017"],
                "inLatencyWindow": ["b:27017", "c:27017"],
            }),
        ),
        (
            "secondary preferred falls back to the primary",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary" },
                        {
                            "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "tags": { "dc": "ny" },
                        },
                    ],
                },
                "readPreference": { "mode": "SecondaryPreferred", "tagSets": [{ "dc": "la" }] },
                "suitableServers": ["a:27017"],
                "inLatencyWindow": ["a:27017"],
            }),
        ),
        (
            "primary preferred without a primary uses secondaries",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetNoPrimary",
                    "servers": [
                        { "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary" },
                        { "address": "c:27017", "avg_rtt_ms": 30, "type": "RSSecondary" },
                        { "address": "d:27017", "avg_rtt_ms": 1, "type": "RSArbiter" },
                    ],
                },
                "readPreference": { "mode": "PrimaryPreferred" },
                "suitableServers": ["b:27017", "c:27017"],
                "inLatencyWindow": ["b:27017"],
            }),
        ),
        (
            "arbiters and ghosts are never selected",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 20, "type": "RSPrimary" },
                        { "address": "d:27017", "avg_rtt_ms": 1, "type": "RSArbiter" },
                        { "address": "e:27017", "avg_rtt_ms": 1, "type": "RSGhost" },
                        { "address": "f:27017", "avg_rtt_ms": 1, "type": "RSOther" },
                    ],
                },
                "readPreference": { "mode": "Nearest" },
                "suitableServers": ["a:27017"],
                "inLatencyWindow": ["a:27017"],
            }),
        ),
        (
            "sharded topologies select any mongos",
            serde_json::json!({
                "topologyDescription": {
                    "type": "Sharded",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 5, "type": "Mongos" },
                        { "address": "b:27017", "avg_rtt_ms": 30, "type": "Mongos" },
                        { "address": "c:27017", "avg_rtt_ms": 10, "type": "Mongos" },
                    ],
                },
                "readPreference": { "mode": "Primary" },
                "suitableServers": ["a:27017", "b:27017", "c:27017"],
                "inLatencyWindow": ["a:27017", "c:27017"],
            }),
        ),
        (
            "unknown topologies have no suitable servers",
            serde_json::json!({
                "topologyDescription": {
                    "type": "Unknown",
                    "servers": [{ "address": "a:27017", "type": "Unknown" }],
                },
                "readPreference": { "mode": "Nearest" },
            }),
        ),
        (
            "single topologies ignore read preference",
            serde_json::json!({
                "topologyDescription": {
                    "type": "Single",
                    "servers": [{ "address": "a:27017", "avg_rtt_ms": 5, "type": "RSSecondary" }],
                },
                "readPreference": { "mode": "Primary" },
                "suitableServers": ["a:27017"],
                "inLatencyWindow": ["a:27017"],
            }),
        ),
        (
            "max staleness measured against the primary",
            serde_json::json!({
                "heartbeatFrequencyMS": 10000,
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        {
                            "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary",
                            "lastUpdateTime": 100000, "lastWriteMS": 100000,
                        },
                        {
                            "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "lastUpdateTime": 100000, "lastWriteMS": 90000,
                        },
                        {
                            "address": "c:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "lastUpdateTime": 200000, "lastWriteMS": 0,
                        },
                    ],
                },
                "readPreference": { "mode": "Secondary", "maxStalenessSeconds": 120 },
                "suitableServers": ["b:27017"],
                "inLatencyWindow": ["b:27017"],
            }),
        ),
        (
            "max staleness measured against the freshest secondary",
            serde_json::json!({
                "heartbeatFrequencyMS": 10000,
                "topologyDescription": {
                    "type": "ReplicaSetNoPrimary",
                    "servers": [
                        {
                            "address": "b:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "lastUpdateTime": 0, "lastWriteMS": 150000,
                        },
                        {
                            "address": "c:27017", "avg_rtt_ms": 5, "type": "RSSecondary",
                            "lastUpdateTime": 0, "lastWriteMS": 0,
                        },
                    ],
                },
                "readPreference": { "mode": "Nearest", "maxStalenessSeconds": 120 },
                "suitableServers": ["b:27017"],
                "inLatencyWindow": ["b:27017"],
            }),
        ),
        (
            "max staleness below the minimum is rejected",
            serde_json::json!({
                "heartbeatFrequencyMS": 10000,
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        { "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary" },
                    ],
                },
                "readPreference": { "mode": "Nearest", "maxStalenessSeconds": 30 },
                "error": true,
            }),
        ),
        (
            "incompatible wire version fails selection",
            serde_json::json!({
                "topologyDescription": {
                    "type": "ReplicaSetWithPrimary",
                    "servers": [
                        {
                            "address": "a:27017", "avg_rtt_ms": 5, "type": "RSPrimary",
                            "maxWireVersion": 2,
                        },
                    ],
                },
                "readPreference": { "mode": "Primary" },
                "error": true,
            }),
        ),
    ];

    for (name, scenario) in scenarios {
        run_test(name, scenario);
    }
}

fn sharded_topology(rtts: &[(&str, u64)]) -> TopologyDescription {
    let mut description = TopologyDescription {
        topology_type: TopologyType::Sharded,
        ..Default::default()
    };
    for (host, rtt) in rtts {
        let server = server_description_with_rtt(
            host,
            hello_response(doc! { "msg": "isdbgrid" }),
            Duration::from_millis(*rtt),
        );
        description.servers.insert(server.address.clone(), server);
    }
    description
}

fn mocked_servers(
    description: &TopologyDescription,
    operation_counts: &[(&str, u32)],
) -> HashMap<ServerAddress, Arc<Server>> {
    description
        .server_addresses()
        .map(|server_address| {
            let count = operation_counts
                .iter()
                .find(|(host, _)| server_address == &address(host))
                .map(|(_, count)| *count)
                .unwrap_or(0);
            (
                server_address.clone(),
                Arc::new(Server::new_mocked(server_address.clone(), count)),
            )
        })
        .collect()
}

fn primary_criteria() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Primary)
}

#[test]
fn selection_never_picks_servers_outside_latency_window() {
    let description = sharded_topology(&[("a:27017", 5), ("b:27017", 8), ("c:27017", 40)]);
    let servers = mocked_servers(&description, &[]);
    let criteria = primary_criteria();

    for _ in 0..100 {
        let selected = attempt_to_select_server(
            &criteria,
            &description,
            &servers,
            None,
            &DefaultStalenessEstimator,
        )
        .unwrap()
        .unwrap();
        assert_ne!(selected.address(), &address("c:27017"));
    }
}

#[test]
fn selection_prefers_server_with_fewer_operations() {
    let description = sharded_topology(&[("a:27017", 5), ("b:27017", 5)]);
    let servers = mocked_servers(&description, &[("a:27017", 10)]);
    let criteria = primary_criteria();

    for _ in 0..20 {
        let selected = attempt_to_select_server(
            &criteria,
            &description,
            &servers,
            None,
            &DefaultStalenessEstimator,
        )
        .unwrap()
        .unwrap();
        assert_eq!(selected.address(), &address("b:27017"));
    }
}

#[test]
fn selected_server_tracks_operation_count() {
    let description = sharded_topology(&[("a:27017", 5)]);
    let servers = mocked_servers(&description, &[]);
    let server = servers.get(&address("a:27017")).unwrap().clone();

    let selected = attempt_to_select_server(
        &primary_criteria(),
        &description,
        &servers,
        None,
        &DefaultStalenessEstimator,
    )
    .unwrap()
    .unwrap();
    assert_eq!(server.operation_count(), 1);
    drop(selected);
    assert_eq!(server.operation_count(), 0);
}

#[test]
fn deprioritized_mongos_is_skipped_when_possible() {
    let description = sharded_topology(&[("a:27017", 5), ("b:27017", 5)]);
    let servers = mocked_servers(&description, &[]);
    let deprioritized = address("a:27017");

    for _ in 0..20 {
        let selected = attempt_to_select_server(
            &primary_criteria(),
            &description,
            &servers,
            Some(&deprioritized),
            &DefaultStalenessEstimator,
        )
        .unwrap()
        .unwrap();
        assert_eq!(selected.address(), &address("b:27017"));
    }

    let description = sharded_topology(&[("a:27017", 5)]);
    let servers = mocked_servers(&description, &[]);
    let selected = attempt_to_select_server(
        &primary_criteria(),
        &description,
        &servers,
        Some(&deprioritized),
        &DefaultStalenessEstimator,
    )
    .unwrap()
    .unwrap();
    assert_eq!(selected.address(), &deprioritized);
}

#[test]
fn predicate_criteria_filters_data_bearing_servers() {
    let description = sharded_topology(&[("a:27017", 5), ("b:27017", 5)]);
    let servers = mocked_servers(&description, &[]);
    let criteria = SelectionCriteria::Predicate(Arc::new(|info: &ServerInfo| {
        info.address().host() == "b"
    }));

    let selected = attempt_to_select_server(
        &criteria,
        &description,
        &servers,
        None,
        &DefaultStalenessEstimator,
    )
    .unwrap()
    .unwrap();
    assert_eq!(selected.address(), &address("b:27017"));
}

#[test]
fn no_suitable_server_returns_none() {
    let mut description = TopologyDescription {
        topology_type: TopologyType::ReplicaSetNoPrimary,
        ..Default::default()
    };
    let secondary = server_description_with_rtt(
        "b:27017",
        hello_response(doc! { "setName": "rs", "secondary": true }),
        Duration::from_millis(5),
    );
    description
        .servers
        .insert(secondary.address.clone(), secondary);
    let servers = mocked_servers(&description, &[]);

    let selected = attempt_to_select_server(
        &primary_criteria(),
        &description,
        &servers,
        None,
        &DefaultStalenessEstimator,
    )
    .unwrap();
    assert!(selected.is_none());

    let message =
        description.server_selection_timeout_error_message(&primary_criteria(), &DefaultStalenessEstimator);
    assert!(message.contains("Rejected servers"), "{}", message);
    assert!(
        message.contains("b:27017: server type RSSecondary does not satisfy read preference"),
        "{}",
        message
    );
}

#[test]
fn timeout_message_without_available_servers() {
    let mut description = TopologyDescription::default();
    let unknown = ServerDescription::new(&address("a:27017"));
    description.servers.insert(unknown.address.clone(), unknown);

    let message =
        description.server_selection_timeout_error_message(&primary_criteria(), &DefaultStalenessEstimator);
    assert!(message.contains("No available servers"), "{}", message);
    assert!(message.contains("a:27017"), "{}", message);
}

#[test]
fn incompatible_topology_fails_with_incompatible_server_error() {
    let mut description = sharded_topology(&[("a:27017", 5)]);
    description.compatibility_error = Some("too old".to_string());
    let servers = mocked_servers(&description, &[]);

    let error = attempt_to_select_server(
        &primary_criteria(),
        &description,
        &servers,
        None,
        &DefaultStalenessEstimator,
    )
    .unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::IncompatibleServer { .. }),
        "{:?}",
        error
    );
}

struct FixedStaleness(Duration);

impl StalenessEstimator for FixedStaleness {
    fn estimate(
        &self,
        _secondary: &ServerInfo<'_>,
        _primary: Option<&ServerInfo<'_>>,
        _max_secondary_last_write_date: Option<DateTime>,
        _heartbeat_frequency: Duration,
    ) -> Option<Duration> {
        Some(self.0)
    }
}

#[test]
fn staleness_estimator_is_pluggable() {
    let mut description = TopologyDescription {
        topology_type: TopologyType::ReplicaSetNoPrimary,
        ..Default::default()
    };
    let responses = [
        (
            "b:27017",
            doc! {
                "setName": "rs",
                "secondary": true,
                "lastWrite": { "lastWriteDate": DateTime::from_millis(1000) },
            },
        ),
        ("c:27017", doc! { "setName": "rs", "secondary": true }),
    ];
    for (host, response) in responses {
        let secondary =
            server_description_with_rtt(host, hello_response(response), Duration::from_millis(5));
        description
            .servers
            .insert(secondary.address.clone(), secondary);
    }
    let read_preference = ReadPreference::Secondary { options: None }
        .with_max_staleness(Duration::from_secs(120))
        .unwrap();

    // Without a reported last write the default estimate cannot place c:27017.
    let suitable = description
        .suitable_servers(&read_preference, &DefaultStalenessEstimator)
        .unwrap();
    assert_eq!(sorted(suitable), vec!["b:27017"]);

    let fresh = FixedStaleness(Duration::from_secs(1));
    let suitable = description
        .suitable_servers(&read_preference, &fresh)
        .unwrap();
    assert_eq!(sorted(suitable), vec!["b:27017", "c:27017"]);

    let stale = FixedStaleness(Duration::from_secs(600));
    let suitable = description
        .suitable_servers(&read_preference, &stale)
        .unwrap();
    assert!(suitable.is_empty());
}
