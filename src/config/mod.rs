//! Network configuration, runtime settings and conf loading.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::netlink::{LinkProvider, VfLinkState};
use crate::sriov::DeviceIntrospection;
use crate::types::{CmdArgs, MacAddr, PluginConf};
use crate::uplink;

mod vlan;

pub use vlan::{parse_trunk_list, resolve_trunk};

pub const DEFAULT_BRIDGE: &str = "cni0";
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni/accelerated-bridge";
pub const DEFAULT_LOCK_FILE: &str = "/var/run/accelerated-bridge-cni/uplink-vlan.lock";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Host-side settings of the plugin, not part of the network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Where ADD leaves the record DEL consumes
    pub cache_dir: PathBuf,
    /// Host-wide lock serializing uplink VLAN changes
    pub lock_file: PathBuf,
    pub sysfs_root: PathBuf,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

impl PluginSettings {
    /// Defaults, overridden by `ACCEL_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(dir) = env::var("ACCEL_BRIDGE_CACHE_DIR") {
            settings.cache_dir = PathBuf::from(dir);
        }
        if let Ok(file) = env::var("ACCEL_BRIDGE_LOCK_FILE") {
            settings.lock_file = PathBuf::from(file);
        }
        if let Ok(root) = env::var("ACCEL_BRIDGE_SYSFS_ROOT") {
            settings.sysfs_root = PathBuf::from(root);
        }
        settings
    }
}

/// Network configuration for the accelerated bridge CNI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// IPAM configuration, passed through to the IPAM plugin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,
    /// Comma separated list of candidate bridges
    pub bridge: String,
    /// PCI address of the VF
    #[serde(rename = "deviceID")]
    pub device_id: String,
    /// Port VLAN, 0 for none
    pub vlan: i64,
    pub trunk: Vec<Trunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Also program the VLANs on the uplink of the bridge
    #[serde(rename = "setUplinkVlan")]
    pub set_uplink_vlan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoofchk: Option<Toggle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust: Option<Toggle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_state: Option<VfLinkState>,
    /// Mbps, 0 disables rate limiting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_tx_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tx_rate: Option<u32>,
    pub debug: bool,
    #[serde(rename = "runtimeConfig")]
    pub runtime_config: RuntimeConfig,
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            cni_version: String::new(),
            name: String::new(),
            plugin_type: String::new(),
            ipam: None,
            bridge: DEFAULT_BRIDGE.to_string(),
            device_id: String::new(),
            vlan: 0,
            trunk: Vec::new(),
            mac: None,
            mtu: None,
            set_uplink_vlan: false,
            spoofchk: None,
            trust: None,
            link_state: None,
            min_tx_rate: None,
            max_tx_rate: None,
            debug: false,
            runtime_config: RuntimeConfig::default(),
        }
    }
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("failed to load netconf: {}", e)))
    }

    /// Candidate bridges, trimmed. Empty entries are rejected.
    pub fn bridges(&self) -> Result<Vec<String>> {
        self.bridge
            .split(',')
            .map(str::trim)
            .map(|b| {
                if b.is_empty() {
                    Err(Error::Config(format!(
                        "bridge list {:?} contains an empty entry",
                        self.bridge
                    )))
                } else {
                    Ok(b.to_string())
                }
            })
            .collect()
    }
}

/// IPAM section; only `type` is interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type")]
    pub ipam_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// One trunk entry: a single id, an inclusive range, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "minID", default, skip_serializing_if = "Option::is_none")]
    pub min_id: Option<i64>,
    #[serde(rename = "maxID", default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(
        rename = "CNIDeviceInfoFile",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_info_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(&self) -> bool {
        *self == Toggle::On
    }
}

/// Turns raw configuration into a [`PluginConf`].
pub trait ConfigLoader {
    /// Decodes, validates and resolves a netconf for ADD.
    fn parse_conf(&self, bytes: &[u8], args: &CmdArgs) -> Result<PluginConf>;
    /// Decodes a netconf without touching the host.
    fn load_conf(&self, bytes: &[u8]) -> Result<NetConf>;
}

/// Production loader, resolving devices through sysfs and links.
pub struct Config {
    sriov: Arc<dyn DeviceIntrospection>,
    nlink: Arc<dyn LinkProvider>,
}

impl Config {
    pub fn new(sriov: Arc<dyn DeviceIntrospection>, nlink: Arc<dyn LinkProvider>) -> Self {
        Self { sriov, nlink }
    }

    fn select_bridge(&self, netconf: &NetConf, pf_name: &str) -> Result<String> {
        let mut candidates = netconf.bridges()?;
        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }

        let pf = self
            .nlink
            .link_by_name(pf_name)
            .map_err(Error::link("find uplink", pf_name))?;
        let bridge = uplink::resolve_parent_bridge(self.nlink.as_ref(), &pf)?;
        if candidates.iter().any(|c| *c == bridge.name) {
            debug!(bridge = %bridge.name, pf = pf_name, "auto-detected bridge");
            Ok(bridge.name)
        } else {
            Err(Error::Config(format!(
                "uplink {} is attached to bridge {} which is not in the bridge list {:?}",
                pf_name, bridge.name, netconf.bridge
            )))
        }
    }
}

impl ConfigLoader for Config {
    fn parse_conf(&self, bytes: &[u8], args: &CmdArgs) -> Result<PluginConf> {
        let netconf = self.load_conf(bytes)?;

        if netconf.device_id.is_empty() {
            return Err(Error::Config("VF pci addr is required".to_string()));
        }
        let pci = netconf.device_id.as_str();

        let pf_name = self.sriov.uplink_name_for_vf(pci)?;
        let vf_id = self.sriov.vf_index(pci, &pf_name)?;

        let mut conf = PluginConf {
            pf_name,
            vf_id,
            ..Default::default()
        };

        conf.is_userspace_driver = self.sriov.has_userspace_driver(pci)?;
        if !conf.is_userspace_driver {
            let host_if_name = self.sriov.vf_netdev_name(pci)?;
            if host_if_name.is_empty() {
                return Err(Error::introspection(pci, "VF name is empty"));
            }
            conf.orig_vf_state.host_if_name = host_if_name;
        }

        if !(0..=4094).contains(&netconf.vlan) {
            return Err(Error::Config(format!(
                "vlan id {} invalid: value must be in the range 0-4094",
                netconf.vlan
            )));
        }
        conf.vlan = netconf.vlan as u16;
        conf.trunk = resolve_trunk(&netconf.trunk)?;

        // an empty value in any source means unset
        let mac = [
            netconf.runtime_config.mac.as_deref(),
            args.args.get("MAC").map(String::as_str),
            netconf.mac.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|m| !m.is_empty());
        conf.mac = mac.map(str::parse::<MacAddr>).transpose()?;

        conf.actual_bridge = self.select_bridge(&netconf, &conf.pf_name)?;
        conf.net_conf = netconf;
        Ok(conf)
    }

    fn load_conf(&self, bytes: &[u8]) -> Result<NetConf> {
        NetConf::parse(bytes)
    }
}
