//! SSH transport for agent sessions

mod handler;
mod listener;

pub use handler::{AgentHandler, SshConfig};
pub use listener::{load_or_generate_host_key, Sshd};
