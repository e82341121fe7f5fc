//! Authentication for agent connections
//!
//! Agents log in with a username and password. The server seeds the
//! credential map from its configuration and adds a random pair at start-up,
//! which node installers hand to the agents they deploy.

mod credentials;

pub use credentials::{generate_credentials, mask_secret, Credentials};
