use std::fmt::Display;

use bson::{oid::ObjectId, Bson, Document};

use crate::{error::Error, sdam::TopologyDescription, selection_criteria::SelectionCriteria};

pub(crate) mod connection;
pub(crate) mod server_selection;
pub(crate) mod topology;

pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_topology::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str =
    "mongodb_topology::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_topology::topology";

/// How a value is rendered as a field of a tracing event.
pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

fn display_string(value: &impl Display) -> String {
    value.to_string()
}

macro_rules! represent_with_display {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl TracingRepresentation for $ty {
                type Representation = String;

                fn tracing_representation(&self) -> String {
                    display_string(self)
                }
            }
        )+
    };
}

// ObjectId displays as its hex string.
represent_with_display!(ObjectId, Error, SelectionCriteria, TopologyDescription);

impl TracingRepresentation for Document {
    type Representation = String;

    /// Relaxed extended JSON, so numbers and dates stay readable in log output.
    fn tracing_representation(&self) -> String {
        Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string()
    }
}
