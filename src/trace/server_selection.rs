use std::time::{Duration, Instant};

use bson::oid::ObjectId;

use super::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET};
use crate::{
    error::Error,
    sdam::{SelectedServer, TopologyDescription},
    selection_criteria::SelectionCriteria,
};

/// Emits a server selection record if `$level` is enabled for the selection target. Every record
/// names the topology, the criteria and the description the selection looked at.
macro_rules! selection_event {
    ($level:ident, $emitter:expr, $description:expr, $message:literal $(, $field:ident = $value:expr)* $(,)?) => {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::$level) {
            tracing::event!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                tracing::Level::$level,
                topologyId = $emitter.topology_id.tracing_representation(),
                selector = $emitter.criteria.tracing_representation(),
                topologyDescription = $description.tracing_representation(),
                $($field = $value,)*
                $message,
            );
        }
    };
}

/// Records the stages of one server selection.
pub(crate) struct ServerSelectionEventEmitter<'a> {
    topology_id: ObjectId,
    criteria: &'a SelectionCriteria,
    start_time: Instant,
    deadline: Instant,
}

impl ServerSelectionEventEmitter<'_> {
    pub(crate) fn new(
        topology_id: ObjectId,
        criteria: &SelectionCriteria,
        start_time: Instant,
        deadline: Instant,
    ) -> ServerSelectionEventEmitter<'_> {
        ServerSelectionEventEmitter {
            topology_id,
            criteria,
            start_time,
            deadline,
        }
    }

    pub(crate) fn emit_started_event(&self, description: &TopologyDescription) {
        selection_event!(DEBUG, self, description, "Server selection started");
    }

    pub(crate) fn emit_failed_event(&self, description: &TopologyDescription, error: &Error) {
        selection_event!(
            DEBUG,
            self,
            description,
            "Server selection failed",
            failure = error.tracing_representation(),
            durationMS = self.start_time.elapsed().as_millis(),
        );
    }

    pub(crate) fn emit_succeeded_event(
        &self,
        description: &TopologyDescription,
        server: &SelectedServer,
    ) {
        selection_event!(
            DEBUG,
            self,
            description,
            "Server selection succeeded",
            serverHost = server.address().host(),
            serverPort = server.address().port(),
            durationMS = self.start_time.elapsed().as_millis(),
        );
    }

    /// Logged once per selection, the first time no suitable server is found.
    pub(crate) fn emit_waiting_event(&self, description: &TopologyDescription) {
        let remaining_time = self
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        selection_event!(
            INFO,
            self,
            description,
            "Waiting for suitable server to become available",
            remainingTimeMS = remaining_time.as_millis(),
        );
    }
}
