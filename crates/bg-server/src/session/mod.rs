//! Agent sessions

mod active;
mod client;
mod exit;
mod pending;

pub use active::ActiveSessions;
pub use client::{ClientSession, SessionContext, SessionSettings, STATS_RECEIVED_AT};
pub use exit::{ExitCallback, ExitHook, EXIT_NORMAL, EXIT_REJECTED, EXIT_STOPPED};
pub use pending::PendingInputs;
