//! This crate keeps track of a MongoDB deployment on behalf of a client. It discovers and monitors
//! the deployment's servers, selects a suitable server for each operation, and pools the
//! connections to every server.
//!
//! # Overview
//!
//! A [`Topology`] is created from a set of [`ClientOptions`](options::ClientOptions). It starts a
//! background monitor for each seed address and keeps its [`TopologyDescription`] up to date as
//! servers respond, fail or are discovered. Each known server owns a connection pool which is
//! paused while the server is unknown and cleared after network errors.
//!
//! Operations go through [`Topology::select_server`] or [`Topology::select_and_check_out`], which
//! wait for the description to change until a server matches the requested
//! [`SelectionCriteria`](selection_criteria::SelectionCriteria) or the selection timeout passes.
//! Errors encountered while running an operation are reported back via
//! [`Topology::report_error`] so that the topology can mark servers unknown and clear pools.
//!
//! The crate does not speak the wire protocol itself. Connections are opened through a
//! [`Transport`](transport::Transport) supplied by the caller, and an optional
//! [`Authenticator`](transport::Authenticator) completes each handshake.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use mongodb_topology::{
//! #     error::Result,
//! #     options::{ClientOptions, ServerAddress},
//! #     selection_criteria::{ReadPreference, SelectionCriteria},
//! #     transport::Transport,
//! #     Topology,
//! # };
//! # fn transport() -> Arc<dyn Transport> { unimplemented!() }
//! # async fn example() -> Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .build();
//! let topology = Topology::new(options, transport(), None)?;
//!
//! let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
//! let connection = topology.select_and_check_out(&criteria, None).await?;
//! # drop(connection);
//! topology.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Events
//!
//! Both the monitoring and the pools publish events describing what they observe. Handlers are
//! registered with [`ClientOptions::sdam_event_handler`](options::ClientOptions::sdam_event_handler)
//! and [`ClientOptions::cmap_event_handler`](options::ClientOptions::cmap_event_handler); see the
//! [`event`] module. The same events are also emitted through `tracing`.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

mod cmap;
pub mod error;
pub mod event;
pub mod hello;
pub mod options;
pub(crate) mod runtime;
mod sdam;
pub mod selection_criteria;
mod serde_util;
mod trace;
pub mod transport;

pub use crate::{
    cmap::{Connection, PooledConnection},
    sdam::{
        DefaultStalenessEstimator,
        ServerInfo,
        ServerType,
        StalenessEstimator,
        Topology,
        TopologyDescription,
        TopologyType,
        TopologyVersion,
    },
};
