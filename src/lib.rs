//! Point-to-point veth CNI plugin
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Creates a veth pair whose ends are named after the gateway and client roles
//! - Moves each end into the namespace of the container taking that role
//! - Renames, brings up and addresses the interface inside the container
//! - Installs a default route towards the gateway on the client side
//! - Records namespace references so later invocations can find each other

pub mod commands;
pub mod config;
pub mod error;
pub mod link;
pub mod netns;
pub mod plugin;
pub mod registry;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, cmd_version, run_cni};
pub use config::{NetConf, Settings};
pub use error::CniError;
pub use link::{NetworkBackend, RtnetlinkBackend};
pub use plugin::{PispPlugin, Role};
pub use registry::NamespaceRegistry;
