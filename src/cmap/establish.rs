pub(crate) mod handshake;

use std::{
    ops::DerefMut,
    sync::Arc,
    time::{Duration, Instant},
};

use self::handshake::Handshaker;
use super::{
    conn::{
        generation_for_service,
        pooled::PooledConnection,
        ConnectionGeneration,
        LoadBalancedGeneration,
        PendingConnection,
    },
    Connection,
    PoolGeneration,
};
use crate::{
    error::{Error, Result},
    hello::HelloReply,
    options::{ClientOptions, Credential, ServerAddress},
    runtime,
    sdam::HandshakePhase,
    transport::{Authenticator, CommandStream, Transport},
};

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// potentially more.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    /// Opens the underlying channels.
    transport: Arc<dyn Transport>,

    /// Authenticates pooled connections when a credential is configured.
    authenticator: Option<Arc<dyn Authenticator>>,

    /// Contains the logic for handshaking a connection.
    handshaker: Handshaker,

    credential: Option<Credential>,

    connect_timeout: Duration,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(
        options: &ClientOptions,
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        // A zero connect timeout means no timeout.
        let connect_timeout = match options.connect_timeout() {
            d if d.is_zero() => Duration::MAX,
            d => d,
        };

        Self {
            transport,
            authenticator,
            handshaker: Handshaker::new(options),
            credential: options.credential.clone(),
            connect_timeout,
        }
    }

    /// Opens a stream and runs the handshake on it. Both steps together are bounded by the
    /// connect timeout, so a server that accepts the socket but never answers still fails.
    async fn connect_and_handshake<C>(
        &self,
        address: &ServerAddress,
        credential: Option<&Credential>,
        wrap: impl FnOnce(Box<dyn CommandStream>) -> C,
    ) -> Result<(C, HelloReply)>
    where
        C: DerefMut<Target = Connection>,
    {
        let attempt = async {
            let stream = self.transport.connect(address).await?;
            let mut connection = wrap(stream);
            let reply = self.handshaker.handshake(&mut connection, credential).await?;
            Ok::<_, Error>((connection, reply))
        };
        runtime::timeout(self.connect_timeout, attempt).await?
    }

    /// Establishes a connection.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<PooledConnection, EstablishError> {
        let pool_gen = pending_connection.generation.clone();
        let address = pending_connection.address.clone();

        let (mut connection, hello_reply) = self
            .connect_and_handshake(&address, self.credential.as_ref(), |stream| {
                PooledConnection::new(pending_connection, stream)
            })
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_gen.clone()))?;

        // A connection to a load balancer derives its generation from the generation of the
        // service it was routed to.
        match (&pool_gen, connection.service_id()) {
            (PoolGeneration::Normal(_), _) => {}
            (PoolGeneration::LoadBalanced(gen_map), Some(service_id)) => {
                connection.generation = LoadBalancedGeneration {
                    generation: generation_for_service(gen_map, &service_id),
                    service_id,
                }
                .into();
            }
            (PoolGeneration::LoadBalanced(_), None) => {
                return Err(EstablishError::post_hello(
                    Error::incompatible_server(
                        "Driver attempted to initialize in load balancing mode, but the server \
                         does not support this mode.",
                    ),
                    connection.generation,
                ));
            }
        }

        if let Some(ref credential) = self.credential {
            let result = match self.authenticator {
                Some(ref authenticator) => runtime::timeout(
                    self.connect_timeout,
                    authenticator.authenticate(&mut connection, credential, &hello_reply),
                )
                .await
                .and_then(|result| result),
                None => Err(Error::authentication_error(
                    credential.mechanism.as_deref().unwrap_or("DEFAULT"),
                    "a credential was supplied but no authenticator is configured",
                )),
            };
            result.map_err(|e| EstablishError::post_hello(e, connection.generation))?;
        }

        Ok(connection)
    }

    /// Establishes a monitoring connection. Monitoring connections are never authenticated.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let (connection, hello_reply) = self
            .connect_and_handshake(&address, None, |stream| {
                Box::new(Connection::new(address.clone(), stream, id, Instant::now()))
            })
            .await?;
        Ok((*connection, hello_reply))
    }
}

/// An error that occurred while establishing a connection, along with how far establishment got
/// before failing.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
