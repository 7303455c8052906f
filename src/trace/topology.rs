use bson::oid::ObjectId;

use crate::event::sdam::SdamEvent;

use super::{TracingRepresentation, TOPOLOGY_TRACING_EVENT_TARGET};

#[derive(Clone)]
pub(crate) struct TopologyTracingEventEmitter {
    topology_id: ObjectId,
}

impl TopologyTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> TopologyTracingEventEmitter {
        TopologyTracingEventEmitter { topology_id }
    }

    pub(crate) fn enabled(&self) -> bool {
        tracing::enabled!(target: TOPOLOGY_TRACING_EVENT_TARGET, tracing::Level::DEBUG)
    }

    pub(crate) fn handle(&self, event: SdamEvent) {
        let topology_id = self.topology_id.tracing_representation();

        macro_rules! debug_event {
            ($message:literal $(, $field:ident = $value:expr)* $(,)?) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = topology_id.as_str(),
                    $($field = $value,)*
                    $message,
                )
            };
        }

        match event {
            SdamEvent::ServerDescriptionChanged(event) => debug_event!(
                "Server description changed",
                serverHost = event.address.host(),
                serverPort = event.address.port(),
                previousType = event.previous_description.server_type().to_string(),
                newType = event.new_description.server_type().to_string(),
            ),
            SdamEvent::ServerOpening(event) => debug_event!(
                "Starting server monitoring",
                serverHost = event.address.host(),
                serverPort = event.address.port(),
            ),
            SdamEvent::ServerClosed(event) => debug_event!(
                "Stopped server monitoring",
                serverHost = event.address.host(),
                serverPort = event.address.port(),
            ),
            SdamEvent::TopologyDescriptionChanged(event) => debug_event!(
                "Topology description changed",
                previousDescription = event.previous_description.tracing_representation(),
                newDescription = event.new_description.tracing_representation(),
            ),
            SdamEvent::TopologyOpening(_) => debug_event!("Starting topology monitoring"),
            SdamEvent::TopologyClosed(_) => debug_event!("Stopped topology monitoring"),
            SdamEvent::ServerHeartbeatStarted(event) => debug_event!(
                "Server heartbeat started",
                serverHost = event.server_address.host(),
                serverPort = event.server_address.port(),
                driverConnectionId = event.driver_connection_id,
                serverConnectionId = event.server_connection_id,
                awaited = event.awaited,
            ),
            SdamEvent::ServerHeartbeatSucceeded(event) => debug_event!(
                "Server heartbeat succeeded",
                serverHost = event.server_address.host(),
                serverPort = event.server_address.port(),
                driverConnectionId = event.driver_connection_id,
                serverConnectionId = event.server_connection_id,
                awaited = event.awaited,
                reply = event.reply.tracing_representation(),
                durationMS = event.duration.as_millis(),
            ),
            SdamEvent::ServerHeartbeatFailed(event) => debug_event!(
                "Server heartbeat failed",
                serverHost = event.server_address.host(),
                serverPort = event.server_address.port(),
                driverConnectionId = event.driver_connection_id,
                serverConnectionId = event.server_connection_id,
                awaited = event.awaited,
                failure = event.failure.tracing_representation(),
                durationMS = event.duration.as_millis(),
            ),
        }
    }
}
