//! Accelerated bridge CNI plugin
//!
//! Hands an SR-IOV VF to a pod while wiring the VF's switchdev representor
//! into a Linux bridge:
//! - Moves the VF netdevice into the pod network namespace
//! - Attaches the representor to the bridge with a PVID and trunk VLANs
//! - Optionally mirrors those VLANs onto the shared uplink, reference counted
//!   across pods under a host-wide lock
//! - Rolls back partial work when ADD fails

pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod ipam;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod sriov;
pub mod types;
pub mod uplink;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::{NetConf, PluginSettings};
pub use error::{Error, Result};
pub use manager::{Manager, VfManager};
pub use plugin::Plugin;
