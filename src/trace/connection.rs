use bson::oid::ObjectId;

use crate::{
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

#[derive(Clone)]
pub(crate) struct ConnectionTracingEventEmitter {
    topology_id: ObjectId,
}

impl ConnectionTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> ConnectionTracingEventEmitter {
        Self { topology_id }
    }

    pub(crate) fn enabled(&self) -> bool {
        tracing::enabled!(target: CONNECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG)
    }

    pub(crate) fn handle(&self, event: CmapEvent) {
        let topology_id = self.topology_id.tracing_representation();

        // Every record names the topology and the pool's server.
        macro_rules! debug_event {
            ($address:expr, $message:literal $(, $field:ident = $value:expr)* $(,)?) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = topology_id.as_str(),
                    serverHost = $address.host(),
                    serverPort = $address.port(),
                    $($field = $value,)*
                    $message,
                )
            };
        }

        match event {
            CmapEvent::PoolCreated(event) => {
                let options = event.options.as_ref();
                debug_event!(
                    event.address,
                    "Connection pool created",
                    maxIdleTimeMS = options.and_then(|o| o.max_idle_time).map(|t| t.as_millis()),
                    maxPoolSize = options.and_then(|o| o.max_pool_size),
                    minPoolSize = options.and_then(|o| o.min_pool_size),
                    maxConnecting = options.and_then(|o| o.max_connecting),
                );
            }
            CmapEvent::PoolReady(event) => debug_event!(event.address, "Connection pool ready"),
            CmapEvent::PoolCleared(event) => debug_event!(
                event.address,
                "Connection pool cleared",
                serviceId = event.service_id.map(|id| id.tracing_representation()),
            ),
            CmapEvent::PoolClosed(event) => debug_event!(event.address, "Connection pool closed"),
            CmapEvent::ConnectionCreated(event) => debug_event!(
                event.address,
                "Connection created",
                driverConnectionId = event.connection_id,
            ),
            CmapEvent::ConnectionReady(event) => debug_event!(
                event.address,
                "Connection ready",
                driverConnectionId = event.connection_id,
                durationMS = event.duration.as_millis(),
            ),
            CmapEvent::ConnectionClosed(event) => debug_event!(
                event.address,
                "Connection closed",
                driverConnectionId = event.connection_id,
                reason = event.reason.tracing_representation(),
                error = event.error.map(|e| e.tracing_representation()),
            ),
            CmapEvent::ConnectionCheckoutStarted(event) => {
                debug_event!(event.address, "Connection checkout started")
            }
            CmapEvent::ConnectionCheckoutFailed(event) => debug_event!(
                event.address,
                "Connection checkout failed",
                reason = event.reason.tracing_representation(),
                error = event.error.map(|e| e.tracing_representation()),
                durationMS = event.duration.as_millis(),
            ),
            CmapEvent::ConnectionCheckedOut(event) => debug_event!(
                event.address,
                "Connection checked out",
                driverConnectionId = event.connection_id,
                durationMS = event.duration.as_millis(),
            ),
            CmapEvent::ConnectionCheckedIn(event) => debug_event!(
                event.address,
                "Connection checked in",
                driverConnectionId = event.connection_id,
            ),
        }
    }
}

impl TracingRepresentation for ConnectionClosedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Stale => "Connection belongs to a generation the pool has cleared",
            Self::Idle => "Connection sat unused in the pool for longer than the max idle time",
            Self::Error => "Connection hit a network error",
            Self::Dropped => "Connection was dropped while a command was in flight",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}

impl TracingRepresentation for ConnectionCheckoutFailedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Timeout => "No connection became available before the checkout deadline",
            Self::ConnectionError => "Pool is paused or a new connection could not be established",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}
