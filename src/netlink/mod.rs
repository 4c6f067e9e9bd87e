//! Link provider capability.
//!
//! Everything the plugin does to network links goes through [`LinkProvider`].
//! The production implementation drives iproute2 ([`IpRoute2`]); tests use the
//! in-memory provider from [`crate::fake`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;

use crate::types::MacAddr;

mod iproute2;

pub use iproute2::IpRoute2;

/// Errors reported by a link provider.
#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    #[error("link {0} not found")]
    NotFound(String),
    #[error("`{command}` failed with status {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse link data: {0}")]
    Parse(#[from] serde_json::Error),
}

/// VF link state as programmed through the PF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfLinkState {
    Auto,
    Enable,
    Disable,
}

impl VfLinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VfLinkState::Auto => "auto",
            VfLinkState::Enable => "enable",
            VfLinkState::Disable => "disable",
        }
    }
}

impl fmt::Display for VfLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Bond,
    Other(String),
}

/// One VF entry of a PF, as reported by the PF.
#[derive(Debug, Clone, PartialEq)]
pub struct VfInfo {
    pub id: u32,
    /// Administrative MAC.
    pub mac: Option<MacAddr>,
    pub spoofchk: bool,
    pub trust: bool,
    pub link_state: VfLinkState,
    pub min_tx_rate: u32,
    pub max_tx_rate: u32,
}

impl VfInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            mac: None,
            spoofchk: true,
            trust: false,
            link_state: VfLinkState::Auto,
            min_tx_rate: 0,
            max_tx_rate: 0,
        }
    }
}

/// Snapshot of a network link.
///
/// Operations that change the identity of a link take `&mut Link` and keep
/// the snapshot in sync with the kernel object.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub mtu: u32,
    pub hardware_addr: Option<MacAddr>,
    pub master_index: Option<u32>,
    pub vfs: Vec<VfInfo>,
}

impl Link {
    pub fn new(index: u32, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            kind: LinkKind::Other("device".to_string()),
            mtu: 1500,
            hardware_addr: None,
            master_index: None,
            vfs: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: LinkKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_master(mut self, master_index: u32) -> Self {
        self.master_index = Some(master_index);
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_hardware_addr(mut self, mac: MacAddr) -> Self {
        self.hardware_addr = Some(mac);
        self
    }

    pub fn with_vfs(mut self, vfs: Vec<VfInfo>) -> Self {
        self.vfs = vfs;
        self
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == LinkKind::Bridge
    }

    pub fn is_bond(&self) -> bool {
        self.kind == LinkKind::Bond
    }

    pub fn vf(&self, id: u32) -> Option<&VfInfo> {
        self.vfs.iter().find(|vf| vf.id == id)
    }
}

/// A bridge VLAN membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeVlan {
    pub vid: u16,
    pub pvid: bool,
    pub untagged: bool,
    /// Program the VLAN on the bridge device itself.
    pub on_self: bool,
    /// Program the VLAN on the port, via its master bridge.
    pub on_master: bool,
}

impl BridgeVlan {
    /// Port VLAN: PVID, egress untagged.
    pub fn pvid(vid: u16) -> Self {
        Self {
            vid,
            pvid: true,
            untagged: true,
            on_self: false,
            on_master: true,
        }
    }

    /// Trunk VLAN: egress tagged.
    pub fn tagged(vid: u16) -> Self {
        Self {
            vid,
            pvid: false,
            untagged: false,
            on_self: false,
            on_master: true,
        }
    }
}

/// Live bridge VLAN membership of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeVlanInfo {
    pub vid: u16,
    pub pvid: bool,
    pub untagged: bool,
}

/// Abstract link operations used by the plugin.
pub trait LinkProvider {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError>;
    fn link_by_index(&self, index: u32) -> Result<Link, NetlinkError>;
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError>;

    fn set_up(&self, link: &Link) -> Result<(), NetlinkError>;
    fn set_down(&self, link: &Link) -> Result<(), NetlinkError>;
    fn set_name(&self, link: &mut Link, name: &str) -> Result<(), NetlinkError>;
    /// Moves the link into the network namespace referred to by `fd`.
    fn set_ns_by_fd(&self, link: &mut Link, fd: RawFd) -> Result<(), NetlinkError>;
    fn set_hardware_addr(&self, link: &mut Link, mac: MacAddr) -> Result<(), NetlinkError>;
    fn set_mtu(&self, link: &mut Link, mtu: u32) -> Result<(), NetlinkError>;
    fn set_master(&self, link: &mut Link, master: &Link) -> Result<(), NetlinkError>;
    fn set_no_master(&self, link: &mut Link) -> Result<(), NetlinkError>;

    fn set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: MacAddr) -> Result<(), NetlinkError>;
    fn set_vf_spoofchk(&self, pf: &Link, vf: u32, on: bool) -> Result<(), NetlinkError>;
    fn set_vf_trust(&self, pf: &Link, vf: u32, on: bool) -> Result<(), NetlinkError>;
    fn set_vf_link_state(&self, pf: &Link, vf: u32, state: VfLinkState) -> Result<(), NetlinkError>;
    /// Rates are in Mbps, 0 disables the limit.
    fn set_vf_rate(&self, pf: &Link, vf: u32, min_tx: u32, max_tx: u32) -> Result<(), NetlinkError>;

    fn bridge_vlan_add(&self, link: &Link, vlan: &BridgeVlan) -> Result<(), NetlinkError>;
    fn bridge_vlan_del(&self, link: &Link, vlan: &BridgeVlan) -> Result<(), NetlinkError>;
    /// VLAN membership of every bridge port, keyed by link index.
    fn bridge_vlan_list(&self) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>, NetlinkError>;
}
