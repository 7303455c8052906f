use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{options::ClientOptions, serde_util::duration_option_as_int_millis};

/// Contains the options for creating a connection pool.
#[serde_with::skip_serializing_none]
#[derive(Clone, Default, Deserialize, TypedBuilder, Serialize, Debug, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. A value of zero means the pool
    /// size is unbounded.
    ///
    /// The default is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, connections will be added to the pool in the background.
    ///
    /// The default is that no minimum is enforced.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default is 2.
    pub max_connecting: Option<u32>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will not be used.
    ///
    /// The default is that connections will not be closed due to being idle.
    #[serde(rename = "maxIdleTimeMS")]
    #[serde(default, with = "duration_option_as_int_millis")]
    pub max_idle_time: Option<Duration>,

    /// How long a check out may wait for a connection before failing.
    ///
    /// The default is to wait until the caller's deadline.
    #[serde(rename = "waitQueueTimeoutMS")]
    #[serde(default, with = "duration_option_as_int_millis")]
    pub wait_queue_timeout: Option<Duration>,

    /// Whether or not the pool is connected to a load balancer.
    #[serde(skip)]
    pub(crate) load_balanced: Option<bool>,

    /// Interval between background runs to close perished connections and maintain
    /// `min_pool_size`.
    #[serde(skip)]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
            load_balanced: options.load_balanced,
            maintenance_frequency: options.min_pool_size_check_frequency,
        }
    }
}
