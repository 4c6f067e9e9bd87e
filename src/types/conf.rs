use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::NetConf;
use crate::netlink::{VfInfo, VfLinkState};
use crate::types::MacAddr;

/// Everything known about one pod interface attachment.
///
/// Built by the config loader during ADD, enriched by the manager while the
/// VF and its representor are wired up, and cached verbatim so that DEL can
/// undo exactly what ADD did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConf {
    /// The network configuration as received on stdin.
    pub net_conf: NetConf,
    /// Validated PVID, 0 when no port VLAN was requested.
    #[serde(default)]
    pub vlan: u16,
    /// Canonical trunk VLAN set, sorted and deduplicated.
    #[serde(default)]
    pub trunk: Vec<u16>,
    /// Effective MAC override after runtimeConfig/CNI_ARGS precedence.
    #[serde(default)]
    pub mac: Option<MacAddr>,
    pub pf_name: String,
    pub vf_id: u32,
    /// The bridge the representor is attached to.
    pub actual_bridge: String,
    #[serde(default)]
    pub representor: String,
    /// VF name inside the pod namespace.
    #[serde(default)]
    pub cont_if_name: String,
    /// VF is bound to a userspace driver and has no netdevice.
    #[serde(default)]
    pub is_userspace_driver: bool,
    #[serde(default)]
    pub orig_vf_state: VfState,
    #[serde(default)]
    pub orig_rep_state: RepState,
}

impl PluginConf {
    pub fn mtu(&self) -> Option<u32> {
        self.net_conf.mtu
    }

    pub fn set_uplink_vlan(&self) -> bool {
        self.net_conf.set_uplink_vlan
    }

    /// VLANs this attachment needs on the uplink: the trunk plus the PVID.
    ///
    /// VLAN 1 is the bridge default and stays as the uplink already carries it.
    pub fn uplink_vlans(&self) -> Vec<u16> {
        let mut vlans: BTreeSet<u16> = self.trunk.iter().copied().collect();
        if self.vlan > 0 {
            vlans.insert(self.vlan);
        }
        vlans.remove(&1);
        vlans.into_iter().collect()
    }
}

/// Original VF state, captured before ADD touches the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfState {
    pub host_if_name: String,
    #[serde(default)]
    pub admin_mac: Option<MacAddr>,
    #[serde(default)]
    pub effective_mac: Option<MacAddr>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub spoofchk: Option<bool>,
    #[serde(default)]
    pub trust: Option<bool>,
    #[serde(default)]
    pub link_state: Option<VfLinkState>,
    #[serde(default)]
    pub min_tx_rate: Option<u32>,
    #[serde(default)]
    pub max_tx_rate: Option<u32>,
}

impl VfState {
    /// Records the PF-side view of the VF. Values already captured are kept.
    pub fn fill_from_vf_info(&mut self, info: &VfInfo) {
        if let Some(mac) = info.mac {
            capture(&mut self.admin_mac, mac);
        }
        capture(&mut self.spoofchk, info.spoofchk);
        capture(&mut self.trust, info.trust);
        capture(&mut self.link_state, info.link_state);
        capture(&mut self.min_tx_rate, info.min_tx_rate);
        capture(&mut self.max_tx_rate, info.max_tx_rate);
    }

    pub fn capture_effective_mac(&mut self, mac: MacAddr) {
        capture(&mut self.effective_mac, mac);
    }

    pub fn capture_mtu(&mut self, mtu: u32) {
        capture(&mut self.mtu, mtu);
    }
}

/// Original representor state, captured right before its MTU is changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepState {
    #[serde(default)]
    pub mtu: Option<u32>,
}

impl RepState {
    pub fn capture_mtu(&mut self, mtu: u32) {
        capture(&mut self.mtu, mtu);
    }
}

// once captured, original state is never overwritten
fn capture<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}
