//! Contains the options for configuring topology monitoring, server selection and connection
//! pooling.

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use bson::{doc, Document};
use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

pub use crate::selection_criteria::{
    Predicate,
    ReadPreference,
    ReadPreferenceOptions,
    SelectionCriteria,
    TagSet,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEvent, sdam::SdamEvent, EventHandler},
    sdam::StalenessEstimator,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// A hostname:port address pair.
#[derive(Clone, Debug, Eq)]
pub struct ServerAddress {
    /// The hostname of the address. Always stored lowercased.
    pub host: String,

    /// The port of the address.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port() == other.port()
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port().hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string of the form `host[:port]` into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be a valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 || parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("invalid server address: \"{}\"", address),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// The port of this address, defaulting to 27017.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

/// Specifies the server API version to declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Version 1.
    V1,
}

impl fmt::Display for ServerApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

/// Options used to declare a versioned server API. The declared version is attached to every
/// handshake this crate sends.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    pub version: ServerApiVersion,

    /// Whether the server should reject all commands that are not part of the declared API
    /// version.
    #[builder(default, setter(strip_option))]
    pub strict: Option<bool>,

    /// Whether the server should return command failures when functionality that is deprecated
    /// from the declared API version is used.
    #[builder(default, setter(strip_option))]
    pub deprecation_errors: Option<bool>,
}

impl ServerApi {
    pub(crate) fn append_to(&self, command: &mut Document) {
        command.insert("apiVersion", self.version.to_string());
        if let Some(strict) = self.strict {
            command.insert("apiStrict", strict);
        }
        if let Some(deprecation_errors) = self.deprecation_errors {
            command.insert("apiDeprecationErrors", deprecation_errors);
        }
    }
}

/// A struct containing authentication information. The mechanism itself is implemented by the
/// [`Authenticator`](crate::transport::Authenticator) supplied to the topology.
#[derive(Clone, Default, Deserialize, TypedBuilder, PartialEq)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The database used to authenticate.
    pub source: Option<String>,

    /// The password to authenticate with.
    #[derive_where(skip)]
    pub password: Option<String>,

    /// Which authentication mechanism to use.
    pub mechanism: Option<String>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The database the handshake's `saslSupportedMechs` request is scoped to.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }

    /// Appends the `saslSupportedMechs` negotiation field to a handshake if no mechanism was
    /// specified.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }
}

/// Contains the options that can be used to create a new
/// [`Topology`](crate::Topology).
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds to connect to.
    ///
    /// By default, other nodes in the cluster are discovered from the seeds. To connect directly
    /// to a single server, set `direct_connection` to `true`.
    #[builder(default = vec![ServerAddress::default()])]
    pub hosts: Vec<ServerAddress>,

    /// The application name sent to the server as part of the handshake.
    #[builder(default, setter(strip_option))]
    pub app_name: Option<String>,

    /// The handler that should process all Connection Monitoring and Pooling events.
    #[builder(default, setter(strip_option, into))]
    pub cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// The handler that should process all Server Discovery and Monitoring events.
    #[builder(default, setter(strip_option, into))]
    pub sdam_event_handler: Option<EventHandler<SdamEvent>>,

    /// The connect timeout applied to establishing connections and to handshakes.
    ///
    /// The default value is 10 seconds.
    #[builder(default, setter(strip_option))]
    pub connect_timeout: Option<Duration>,

    /// The credential used to authenticate pooled connections.
    #[builder(default, setter(strip_option))]
    pub credential: Option<Credential>,

    /// Whether to connect directly to a single host rather than discover the whole cluster.
    ///
    /// The default value is false.
    #[builder(default, setter(strip_option))]
    pub direct_connection: Option<bool>,

    /// The amount of time each monitor waits between heartbeats.
    ///
    /// The default value is 10 seconds.
    #[builder(default, setter(strip_option))]
    pub heartbeat_freq: Option<Duration>,

    /// The minimum amount of time between two heartbeats of the same server, including checks
    /// requested after an operation failure.
    ///
    /// The default value is 500 milliseconds.
    #[builder(default, setter(strip_option))]
    pub min_heartbeat_freq: Option<Duration>,

    /// Whether the seed is a load balancer in front of a sharded cluster.
    #[builder(default, setter(strip_option))]
    pub load_balanced: Option<bool>,

    /// How much longer the average round trip time of a server may be compared to the fastest
    /// suitable server for it to still be eligible for selection. For example, with servers at
    /// 5 ms, 10 ms and 15 ms and a threshold of 8 ms, only the first two are eligible.
    ///
    /// The default value is 15 ms.
    #[builder(default, setter(strip_option))]
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a pool before being closed. Zero
    /// disables idle eviction.
    #[builder(default, setter(strip_option))]
    pub max_idle_time: Option<Duration>,

    /// The maximum number of connections (checked out, available and pending) a pool may hold.
    /// Zero means no limit.
    ///
    /// The default value is 10.
    #[builder(default, setter(strip_option))]
    pub max_pool_size: Option<u32>,

    /// The number of connections a pool keeps open in the background.
    ///
    /// The default value is 0.
    #[builder(default, setter(strip_option))]
    pub min_pool_size: Option<u32>,

    /// The maximum number of connections a pool may be establishing concurrently.
    ///
    /// The default value is 2.
    #[builder(default, setter(strip_option))]
    pub max_connecting: Option<u32>,

    /// The interval at which each pool evicts perished connections and tops itself up to
    /// `min_pool_size`.
    ///
    /// The default value is 100 milliseconds.
    #[builder(default, setter(strip_option))]
    pub min_pool_size_check_frequency: Option<Duration>,

    /// The name of the replica set to connect to.
    #[builder(default, setter(strip_option))]
    pub repl_set_name: Option<String>,

    /// The declared API version sent with every handshake.
    #[builder(default, setter(strip_option))]
    pub server_api: Option<ServerApi>,

    /// How long server selection may block before failing.
    ///
    /// The default value is 30 seconds.
    #[builder(default, setter(strip_option))]
    pub server_selection_timeout: Option<Duration>,

    /// The policy used to estimate the staleness of secondaries when a `max_staleness` is given.
    /// Defaults to [`DefaultStalenessEstimator`](crate::sdam::DefaultStalenessEstimator).
    #[builder(default, setter(strip_option))]
    #[derive_where(skip)]
    pub staleness_estimator: Option<Arc<dyn StalenessEstimator>>,

    /// The amount of time a checkout may wait for a connection to become available, in addition
    /// to the deadline passed by the caller.
    ///
    /// By default, checkouts are bounded only by the caller's deadline.
    #[builder(default, setter(strip_option))]
    pub wait_queue_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientOptions {
    /// Ensures the options are internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with loadBalanced=true",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::invalid_argument(
                    "cannot specify replicaSet with loadBalanced=true",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::invalid_argument(
                    "cannot specify directConnection=true with loadBalanced=true",
                ));
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_frequency() {
                return Err(Error::invalid_argument(format!(
                    "heartbeat frequency must be at least {}ms, got {}ms",
                    self.min_heartbeat_frequency().as_millis(),
                    heartbeat_freq.as_millis()
                )));
            }
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if max != 0 && min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({}) must not exceed max_pool_size ({})",
                    min, max
                )));
            }
        }

        if self.max_connecting == Some(0) {
            return Err(Error::invalid_argument("max_connecting must be positive"));
        }

        Ok(())
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_freq
            .unwrap_or(DEFAULT_MIN_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    pub(crate) fn is_load_balanced(&self) -> bool {
        self.load_balanced == Some(true)
    }

    /// Builds the client metadata attached to the initial handshake on every connection.
    pub(crate) fn client_metadata(&self) -> Document {
        let mut metadata = doc! {
            "driver": {
                "name": "mongodb-topology",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };
        if let Some(ref app_name) = self.app_name {
            metadata.insert("application", doc! { "name": app_name });
        }
        metadata
    }
}

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_address() {
        let address = ServerAddress::parse("LocalHost:27018").unwrap();
        assert_eq!(address.host(), "localhost");
        assert_eq!(address.port(), 27018);

        assert_eq!(
            ServerAddress::parse("a").unwrap(),
            ServerAddress::parse("a:27017").unwrap()
        );
        assert_eq!(ServerAddress::parse("a").unwrap().to_string(), "a:27017");

        assert!(ServerAddress::parse("a:b").is_err());
        assert!(ServerAddress::parse("a:0").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
        assert!(ServerAddress::parse("a:1:2").is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_options() {
        let two_hosts = vec![
            ServerAddress::parse("a").unwrap(),
            ServerAddress::parse("b").unwrap(),
        ];

        let options = ClientOptions::builder()
            .hosts(two_hosts.clone())
            .direct_connection(true)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .hosts(two_hosts)
            .load_balanced(true)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .load_balanced(true)
            .repl_set_name("rs".to_string())
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .heartbeat_freq(Duration::from_millis(10))
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .min_pool_size(5)
            .max_pool_size(2)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder().max_connecting(0).build();
        assert!(options.validate().is_err());

        assert!(ClientOptions::default().validate().is_ok());
    }

    #[test]
    fn credential_debug_hides_password() {
        let credential = Credential::builder()
            .username("user".to_string())
            .password("hunter2".to_string())
            .build();
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }
}
