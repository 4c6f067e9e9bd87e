#![allow(dead_code)]

use std::sync::Arc;

use accelerated_bridge_cni::config::{Config, ConfigLoader};
use accelerated_bridge_cni::fake::{FakeIntrospection, FakeLock, FakeNetlink};
use accelerated_bridge_cni::netlink::{Link, LinkKind, VfInfo};
use accelerated_bridge_cni::types::{CmdArgs, MacAddr, PluginConf};
use accelerated_bridge_cni::VfManager;

pub const BRIDGE: &str = "br0";
pub const BOND: &str = "bond0";
pub const PF: &str = "enp3s0f0";
pub const VF0_PCI: &str = "0000:03:00.2";
pub const VF1_PCI: &str = "0000:03:00.3";
pub const VF0_NETDEV: &str = "enp3s0f0v0";
pub const VF1_NETDEV: &str = "enp3s0f0v1";
pub const REP0: &str = "pf0vf0";
pub const REP1: &str = "pf0vf1";
pub const POD_NETNS: &str = "/var/run/netns/pod1";

pub const BRIDGE_INDEX: u32 = 10;
pub const BOND_INDEX: u32 = 11;
pub const PF_INDEX: u32 = 2;
pub const VF0_INDEX: u32 = 20;
pub const REP0_INDEX: u32 = 30;
pub const REP1_INDEX: u32 = 31;

pub const VF0_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x20];
pub const VF0_ADMIN_MAC: [u8; 6] = [0x02, 0xaa, 0x00, 0x00, 0x00, 0x01];

/// A switchdev host: one PF enslaved to a bond on `br0`, two VFs with
/// representors, and one pod namespace.
pub struct Host {
    pub nlink: FakeNetlink,
    pub sriov: Arc<FakeIntrospection>,
    pub lock: Arc<FakeLock>,
    pub pod_ns: u32,
}

impl Host {
    pub fn new() -> Self {
        let nlink = FakeNetlink::new();
        nlink.add_link(Link::new(BRIDGE_INDEX, BRIDGE).with_kind(LinkKind::Bridge));
        nlink.add_link(
            Link::new(BOND_INDEX, BOND)
                .with_kind(LinkKind::Bond)
                .with_master(BRIDGE_INDEX),
        );

        let mut vf0 = VfInfo::new(0);
        vf0.mac = Some(MacAddr::from(VF0_ADMIN_MAC));
        nlink.add_link(
            Link::new(PF_INDEX, PF)
                .with_master(BOND_INDEX)
                .with_vfs(vec![vf0, VfInfo::new(1)]),
        );
        nlink.add_link(Link::new(VF0_INDEX, VF0_NETDEV).with_hardware_addr(MacAddr::from(VF0_MAC)));
        nlink.add_link(Link::new(21, VF1_NETDEV));
        nlink.add_link(Link::new(REP0_INDEX, REP0));
        nlink.add_link(Link::new(REP1_INDEX, REP1));
        let pod_ns = nlink.add_namespace(POD_NETNS);

        let sriov = FakeIntrospection::new()
            .with_vf(VF0_PCI, PF, 0, VF0_NETDEV, REP0)
            .with_vf(VF1_PCI, PF, 1, VF1_NETDEV, REP1);

        Self {
            nlink,
            sriov: Arc::new(sriov),
            lock: Arc::new(FakeLock::new()),
            pod_ns,
        }
    }

    pub fn manager(&self) -> VfManager {
        VfManager::new(
            Arc::new(self.nlink.clone()),
            self.sriov.clone(),
            Arc::new(self.nlink.namespaces()),
            self.lock.clone(),
        )
    }

    pub fn config(&self) -> Config {
        Config::new(self.sriov.clone(), Arc::new(self.nlink.clone()))
    }

    /// Resolves `netconf` the way ADD does.
    pub fn conf(&self, netconf: &str) -> Result<PluginConf, Box<dyn std::error::Error>> {
        let args = cmd_args(netconf);
        Ok(self.config().parse_conf(netconf.as_bytes(), &args)?)
    }

    pub fn link(&self, name: &str) -> Link {
        self.nlink
            .link_in(accelerated_bridge_cni::fake::INIT_NS, name)
            .unwrap_or_else(|| panic!("no link {} in the initial namespace", name))
    }
}

pub fn cmd_args(netconf: &str) -> CmdArgs {
    CmdArgs {
        container_id: "c0ffee".to_string(),
        netns: POD_NETNS.to_string(),
        ifname: "net1".to_string(),
        stdin_data: netconf.as_bytes().to_vec(),
        ..Default::default()
    }
}

/// A netconf for VF 0 on `br0` with `extra` JSON members spliced in.
pub fn netconf(extra: &str) -> String {
    netconf_on(BRIDGE, extra)
}

pub fn netconf_on(bridge: &str, extra: &str) -> String {
    let mut conf = format!(
        r#"{{"cniVersion":"1.0.0","name":"accel-net","type":"accelerated-bridge","bridge":"{}","deviceID":"{}""#,
        bridge, VF0_PCI
    );
    if !extra.is_empty() {
        conf.push(',');
        conf.push_str(extra);
    }
    conf.push('}');
    conf
}
