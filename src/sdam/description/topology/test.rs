use std::time::Duration;

use bson::{doc, oid::ObjectId, Document};
use pretty_assertions::assert_eq;

use super::{TopologyDescription, TopologyType};
use crate::{
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
};

pub(crate) fn f64_ms_as_duration(f: f64) -> Duration {
    Duration::from_micros((f * 1000.0) as u64)
}

pub(crate) fn address(address: &str) -> ServerAddress {
    ServerAddress::parse(address).unwrap()
}

/// A hello response from a server speaking a wire version this client supports.
pub(crate) fn hello_response(mut fields: Document) -> Document {
    for (key, value) in [("ok", 1), ("minWireVersion", 0), ("maxWireVersion", 21)] {
        if !fields.contains_key(key) {
            fields.insert(key, value);
        }
    }
    fields
}

pub(crate) fn server_description(address: &str, response: Document) -> ServerDescription {
    server_description_with_rtt(address, response, Duration::ZERO)
}

pub(crate) fn server_description_with_rtt(
    address: &str,
    response: Document,
    average_rtt: Duration,
) -> ServerDescription {
    let address = self::address(address);
    let command_response: HelloCommandResponse = bson::from_document(response.clone()).unwrap();
    let reply = HelloReply {
        server_address: address.clone(),
        command_response,
        raw_command_response: response,
    };
    ServerDescription::new_from_hello_reply(address, reply, average_rtt)
}

fn topology(hosts: &[&str]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
        .build();
    TopologyDescription::new(&options)
}

fn election_id(n: u8) -> ObjectId {
    let mut bytes = [0; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

fn primary(address: &str, hosts: &[&str], set_version: i32, election: u8) -> ServerDescription {
    server_description(
        address,
        hello_response(doc! {
            "isWritablePrimary": true,
            "setName": "rs",
            "hosts": hosts,
            "me": address,
            "setVersion": set_version,
            "electionId": election_id(election),
        }),
    )
}

fn secondary(address: &str, hosts: &[&str], primary: Option<&str>) -> ServerDescription {
    let mut response = doc! {
        "secondary": true,
        "setName": "rs",
        "hosts": hosts,
        "me": address,
    };
    if let Some(primary) = primary {
        response.insert("primary", primary);
    }
    server_description(address, hello_response(response))
}

fn server_type(description: &TopologyDescription, host: &str) -> Option<ServerType> {
    description
        .get_server_description(&address(host))
        .map(|sd| sd.server_type)
}

fn sorted_addresses(description: &TopologyDescription) -> Vec<String> {
    let mut addresses: Vec<_> = description
        .server_addresses()
        .map(|a| a.to_string())
        .collect();
    addresses.sort();
    addresses
}

#[test]
fn secondary_moves_unknown_topology_to_replica_set_no_primary() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(secondary(
            "a:27017",
            &["a:27017", "b:27017", "c:27017"],
            None,
        ))
        .unwrap();

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
    assert_eq!(description.set_name(), Some("rs"));
    assert_eq!(
        sorted_addresses(&description),
        vec!["a:27017", "b:27017", "c:27017"]
    );
    assert_eq!(
        server_type(&description, "c:27017"),
        Some(ServerType::Unknown)
    );
}

#[test]
fn reported_primary_becomes_possible_primary() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(secondary(
            "a:27017",
            &["a:27017", "b:27017"],
            Some("b:27017"),
        ))
        .unwrap();

    assert_eq!(
        server_type(&description, "b:27017"),
        Some(ServerType::PossiblePrimary)
    );
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
}

#[test]
fn discovering_primary_moves_to_replica_set_with_primary() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(secondary("a:27017", &["a:27017", "b:27017"], None))
        .unwrap();
    description
        .update(primary("b:27017", &["a:27017", "b:27017"], 1, 1))
        .unwrap();

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    assert_eq!(description.max_set_version(), Some(1));
    assert_eq!(description.max_election_id(), Some(election_id(1)));
}

#[test]
fn newer_primary_demotes_previous_primary() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);
    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();
    description.update(primary("b:27017", &hosts, 1, 2)).unwrap();

    assert_eq!(
        server_type(&description, "a:27017"),
        Some(ServerType::Unknown)
    );
    assert_eq!(
        server_type(&description, "b:27017"),
        Some(ServerType::RsPrimary)
    );
    assert_eq!(
        description
            .servers_with_type(&[ServerType::RsPrimary])
            .count(),
        1
    );
    assert_eq!(description.max_election_id(), Some(election_id(2)));
}

#[test]
fn stale_primary_is_marked_unknown_and_replay_is_idempotent() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);
    description.update(primary("b:27017", &hosts, 1, 2)).unwrap();

    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();
    assert_eq!(
        server_type(&description, "a:27017"),
        Some(ServerType::Unknown)
    );
    assert_eq!(
        server_type(&description, "b:27017"),
        Some(ServerType::RsPrimary)
    );
    assert_eq!(description.max_election_id(), Some(election_id(2)));

    let before = description.clone();
    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();
    assert!(description.diff(&before).is_none());
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
}

#[test]
fn higher_set_version_wins_over_election_id() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);
    description.update(primary("a:27017", &hosts, 2, 1)).unwrap();
    description.update(primary("b:27017", &hosts, 1, 5)).unwrap();

    assert_eq!(
        server_type(&description, "a:27017"),
        Some(ServerType::RsPrimary)
    );
    assert_eq!(
        server_type(&description, "b:27017"),
        Some(ServerType::Unknown)
    );
    assert_eq!(description.max_set_version(), Some(2));
}

#[test]
fn primary_removes_hosts_it_does_not_list() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(primary("a:27017", &["a:27017", "c:27017"], 1, 1))
        .unwrap();

    assert_eq!(sorted_addresses(&description), vec!["a:27017", "c:27017"]);
}

#[test]
fn losing_primary_moves_to_replica_set_no_primary() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);
    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();
    description
        .update(ServerDescription::new(&address("a:27017")))
        .unwrap();

    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
}

#[test]
fn member_of_other_set_is_removed() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);
    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();
    description
        .update(server_description(
            "b:27017",
            hello_response(doc! { "secondary": true, "setName": "other", "hosts": ["b:27017"] }),
        ))
        .unwrap();

    assert_eq!(sorted_addresses(&description), vec!["a:27017"]);
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
}

#[test]
fn sharded_topology_drops_non_mongos_servers() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description(
            "a:27017",
            hello_response(doc! { "msg": "isdbgrid" }),
        ))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);

    description
        .update(primary("b:27017", &["b:27017"], 1, 1))
        .unwrap();
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    assert_eq!(sorted_addresses(&description), vec!["a:27017"]);
}

#[test]
fn standalone_among_several_seeds_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(server_description("a:27017", hello_response(doc! {})))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::Unknown);
    assert_eq!(sorted_addresses(&description), vec!["b:27017"]);
}

#[test]
fn standalone_single_seed_becomes_single() {
    let mut description = topology(&["a:27017"]);
    description
        .update(server_description("a:27017", hello_response(doc! {})))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::Single);
    assert_eq!(
        server_type(&description, "a:27017"),
        Some(ServerType::Standalone)
    );
}

#[test]
fn direct_connection_with_wrong_set_name_is_unknown() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .direct_connection(true)
        .repl_set_name("rs".to_string())
        .build();
    let mut description = TopologyDescription::new(&options);
    description
        .update(server_description(
            "a:27017",
            hello_response(doc! { "isWritablePrimary": true, "setName": "other" }),
        ))
        .unwrap();

    assert_eq!(description.topology_type(), TopologyType::Single);
    let server = description
        .get_server_description(&address("a:27017"))
        .unwrap();
    assert_eq!(server.server_type, ServerType::Unknown);
    assert!(server.reply.is_err());
}

#[test]
fn older_topology_version_is_ignored() {
    let process_id = ObjectId::new();
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts);

    let mut response = doc! {
        "secondary": true,
        "setName": "rs",
        "hosts": &hosts[..],
        "topologyVersion": { "processId": process_id, "counter": 2_i64 },
    };
    description
        .update(server_description("a:27017", hello_response(response.clone())))
        .unwrap();

    response.remove("secondary");
    response.insert("isWritablePrimary", true);
    response.insert(
        "topologyVersion",
        doc! { "processId": process_id, "counter": 1_i64 },
    );
    description
        .update(server_description("a:27017", hello_response(response)))
        .unwrap();

    assert_eq!(
        server_type(&description, "a:27017"),
        Some(ServerType::RsSecondary)
    );
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );
}

#[test]
fn updates_for_unknown_addresses_are_ignored() {
    let mut description = topology(&["a:27017"]);
    let before = description.clone();
    description
        .update(server_description("z:27017", hello_response(doc! {})))
        .unwrap();

    assert!(before.diff(&description).is_none());
}

#[test]
fn old_wire_version_records_compatibility_error() {
    let mut description = topology(&["a:27017"]);
    description
        .update(server_description(
            "a:27017",
            hello_response(doc! { "maxWireVersion": 6 }),
        ))
        .unwrap();

    let message = description.compatibility_error().unwrap();
    assert!(message.contains("requires at least 7"), "{}", message);
}

#[test]
fn load_balanced_topology_starts_with_load_balancer() {
    let options = ClientOptions::builder()
        .hosts(vec![address("lb:27017")])
        .load_balanced(true)
        .build();
    let description = TopologyDescription::new(&options);

    assert_eq!(description.topology_type(), TopologyType::LoadBalanced);
    assert_eq!(
        server_type(&description, "lb:27017"),
        Some(ServerType::LoadBalancer)
    );
    assert!(description.has_available_servers());
}

#[test]
fn diff_reports_added_removed_and_changed_servers() {
    let old = topology(&["a:27017", "b:27017"]);
    let mut new = old.clone();
    new.update(primary("a:27017", &["a:27017", "c:27017"], 1, 1))
        .unwrap();

    let diff = old.diff(&new).unwrap();
    assert_eq!(
        diff.removed_addresses.into_iter().cloned().collect::<Vec<_>>(),
        vec![address("b:27017")]
    );
    assert_eq!(
        diff.added_addresses.into_iter().cloned().collect::<Vec<_>>(),
        vec![address("c:27017")]
    );
    assert!(diff.changed_servers.contains_key(&address("a:27017")));
}

#[test]
fn display_lists_type_and_servers() {
    let hosts = ["a:27017"];
    let mut description = topology(&hosts);
    description.update(primary("a:27017", &hosts, 1, 1)).unwrap();

    let display = description.to_string();
    assert!(display.contains("Type: ReplicaSetWithPrimary"), "{}", display);
    assert!(display.contains("Set Name: rs"), "{}", display);
    assert!(display.contains("Address: a:27017"), "{}", display);
}

#[test]
fn rtt_helper_converts_fractional_millis() {
    assert_eq!(f64_ms_as_duration(1.5), Duration::from_micros(1500));
}
