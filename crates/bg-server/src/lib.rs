//! bg-server: Control-plane endpoint for node agents
//!
//! The server accepts SSH connections from node agents, runs the line
//! protocol on each shell channel and tracks every node's lifecycle in the
//! node registry. A pluggable coordinator decides what each agent is told
//! once it registers.

pub mod auth;
pub mod baguette;
pub mod coordinator;
pub mod events;
pub mod listing;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod topology;
pub mod truststore;

pub use baguette::{BaguetteServer, BaguetteServerBuilder};
pub use coordinator::{CoordinatorRegistry, ServerCoordinator};
pub use events::{EventBus, ServerEvent};
pub use listing::NodeSummary;
pub use registry::{NodeRegistry, NodeRegistryEntry};
pub use session::{ActiveSessions, ClientSession};
pub use topology::{BrokerEndpoint, Topology, TranslationContext};
