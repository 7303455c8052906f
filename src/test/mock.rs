use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, oid::ObjectId, Document};
use futures_util::future::{self, BoxFuture, FutureExt};

use crate::{
    error::Result,
    hello::LEGACY_HELLO_COMMAND_NAME,
    options::ServerAddress,
    runtime,
    transport::{Command, CommandStream, Transport},
};

const MAX_WIRE_VERSION: i32 = 21;

/// An in-memory deployment. Each reachable server answers handshakes with a scripted reply and
/// acknowledges every other command. Awaitable hellos are answered after their max await time,
/// as if nothing had changed on the server.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    hello_replies: HashMap<ServerAddress, Document>,
    command_failures: HashMap<ServerAddress, Document>,
    unresponsive: HashSet<ServerAddress>,
    connections_opened: HashMap<ServerAddress, u32>,
    connect_delay: Option<Duration>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes `address` reachable, replying to handshakes with `reply`.
    pub(crate) fn set_hello(&self, address: &ServerAddress, reply: Document) {
        self.inner
            .lock()
            .unwrap()
            .hello_replies
            .insert(address.clone(), reply);
    }

    /// Makes `address` unreachable. New connections are refused and commands on existing ones
    /// fail with a network error.
    pub(crate) fn set_unreachable(&self, address: &ServerAddress) {
        self.inner.lock().unwrap().hello_replies.remove(address);
    }

    /// Makes the server at `address` answer every non-handshake command with `reply`, which is
    /// expected to be an `ok: 0` error reply.
    pub(crate) fn fail_commands(&self, address: &ServerAddress, reply: Document) {
        self.inner
            .lock()
            .unwrap()
            .command_failures
            .insert(address.clone(), reply);
    }

    /// Makes the server at `address` accept connections but never answer any command.
    pub(crate) fn set_unresponsive(&self, address: &ServerAddress) {
        self.inner
            .lock()
            .unwrap()
            .unresponsive
            .insert(address.clone());
    }

    /// Delays every connection attempt by `delay`.
    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = Some(delay);
    }

    pub(crate) fn connections_opened(&self, address: &ServerAddress) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .connections_opened
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn as_transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

impl Transport for MockTransport {
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn CommandStream>>> {
        Box::pin(async move {
            let delay = self.inner.lock().unwrap().connect_delay;
            if let Some(delay) = delay {
                runtime::delay_for(delay).await;
            }

            let mut state = self.inner.lock().unwrap();
            if !state.hello_replies.contains_key(address) {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            *state
                .connections_opened
                .entry(address.clone())
                .or_default() += 1;

            let stream: Box<dyn CommandStream> = Box::new(MockStream {
                address: address.clone(),
                transport: self.clone(),
            });
            Ok(stream)
        })
    }
}

struct MockStream {
    address: ServerAddress,
    transport: MockTransport,
}

impl CommandStream for MockStream {
    fn send_command(&mut self, command: Command) -> BoxFuture<'_, Result<Document>> {
        let is_hello = command.name == "hello" || command.name == LEGACY_HELLO_COMMAND_NAME;
        let await_time = command
            .body
            .get_i64("maxAwaitTimeMS")
            .ok()
            .filter(|_| is_hello)
            .map(|ms| Duration::from_millis(ms as u64));

        let result = {
            let state = self.transport.inner.lock().unwrap();
            if state.unresponsive.contains(&self.address) {
                return future::pending().boxed();
            }
            match state.hello_replies.get(&self.address) {
                None => Err(std::io::ErrorKind::ConnectionReset.into()),
                Some(reply) if is_hello => Ok(reply.clone()),
                Some(_) => match state.command_failures.get(&self.address) {
                    Some(reply) => Ok(reply.clone()),
                    None => Ok(doc! { "ok": 1 }),
                },
            }
        };
        Box::pin(async move {
            if let Some(await_time) = await_time {
                runtime::delay_for(await_time).await;
            }
            result
        })
    }
}

pub(crate) fn standalone_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}

pub(crate) fn mongos_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "msg": "isdbgrid",
        "helloOk": true,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}

pub(crate) fn rs_primary_hello(set_name: &str, hosts: &[&str], me: &str) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "setName": set_name,
        "setVersion": 1,
        "electionId": ObjectId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
        "hosts": hosts,
        "me": me,
        "primary": me,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}

pub(crate) fn rs_secondary_hello(set_name: &str, hosts: &[&str], me: &str) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": false,
        "secondary": true,
        "helloOk": true,
        "setName": set_name,
        "hosts": hosts,
        "me": me,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}

pub(crate) fn load_balancer_hello(service_id: ObjectId) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "msg": "isdbgrid",
        "helloOk": true,
        "serviceId": service_id,
        "minWireVersion": 0,
        "maxWireVersion": MAX_WIRE_VERSION,
    }
}
