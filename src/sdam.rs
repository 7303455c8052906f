mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

pub use self::{
    description::{
        server::TopologyVersion,
        topology::{
            server_selection::{DefaultStalenessEstimator, StalenessEstimator},
            TopologyDescription,
        },
    },
    public::{ServerInfo, ServerType, TopologyType},
    topology::Topology,
};

pub(crate) use self::{
    description::{server::ServerDescription, topology::server_selection::SelectedServer},
    server::Server,
    topology::{HandshakePhase, TopologyUpdater},
};
