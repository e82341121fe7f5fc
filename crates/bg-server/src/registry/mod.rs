//! Node registry and per-node lifecycle records

mod entry;
mod node_registry;

pub use entry::{error_info, NodeRegistryEntry};
pub use node_registry::NodeRegistry;
