//! In-memory stand-ins for the host capabilities.
//!
//! [`FakeNetlink`] models links spread over network namespaces. Namespace
//! handles from [`FakeNamespaces`] share its state, so `run_in` switches the
//! namespace link lookups resolve in, the way `setns` does for the real
//! provider.

use anyhow::bail;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::StateCache;
use crate::error::{Error, Result};
use crate::ipam::Ipam;
use crate::lock::IpcLock;
use crate::netlink::{
    BridgeVlan, BridgeVlanInfo, Link, LinkProvider, NetlinkError, VfLinkState,
};
use crate::netns::{Namespaces, NetNs, NsError};
use crate::sriov::DeviceIntrospection;
use crate::types::{MacAddr, PluginConf, Result as CniResult};

/// Id of the namespace the fake starts in.
pub const INIT_NS: u32 = 0;

#[derive(Debug, Default)]
struct HostState {
    links: Vec<(u32, Link)>,
    up: HashSet<u32>,
    vlans: HashMap<u32, Vec<BridgeVlanInfo>>,
    namespaces: HashMap<String, u32>,
    current_ns: u32,
    failures: HashSet<(String, String)>,
    journal: Vec<String>,
}

impl HostState {
    fn find(&self, name: &str) -> Option<usize> {
        let ns = self.current_ns;
        self.links.iter().position(|(n, l)| *n == ns && l.name == name)
    }

    fn check(&self, op: &str, name: &str) -> std::result::Result<usize, NetlinkError> {
        if self.failures.contains(&(op.to_string(), name.to_string())) {
            return Err(NetlinkError::Command {
                command: format!("{} {}", op, name),
                status: Some(2),
                stderr: "injected failure".to_string(),
            });
        }
        self.find(name)
            .ok_or_else(|| NetlinkError::NotFound(name.to_string()))
    }

    fn record(&mut self, entry: String) {
        self.journal.push(entry);
    }

    fn vf_mut(
        &mut self,
        op: &str,
        pf: &Link,
        vf: u32,
    ) -> std::result::Result<&mut crate::netlink::VfInfo, NetlinkError> {
        let pos = self.check(op, &pf.name)?;
        self.links[pos]
            .1
            .vfs
            .iter_mut()
            .find(|v| v.id == vf)
            .ok_or_else(|| NetlinkError::NotFound(format!("{} vf {}", pf.name, vf)))
    }
}

/// In-memory link provider.
#[derive(Debug, Clone, Default)]
pub struct FakeNetlink {
    state: Arc<Mutex<HostState>>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `link` to the initial namespace.
    pub fn add_link(&self, link: Link) {
        self.state().links.push((INIT_NS, link));
    }

    /// Registers a namespace reachable through `path` and returns its id.
    pub fn add_namespace(&self, path: &str) -> u32 {
        let mut state = self.state();
        let id = state.namespaces.len() as u32 + 1;
        state.namespaces.insert(path.to_string(), id);
        id
    }

    pub fn namespaces(&self) -> FakeNamespaces {
        FakeNamespaces {
            state: self.state.clone(),
        }
    }

    /// Makes every later `op` on the link called `name` fail.
    pub fn fail(&self, op: &str, name: &str) {
        self.state()
            .failures
            .insert((op.to_string(), name.to_string()));
    }

    /// The link called `name` in namespace `ns`.
    pub fn link_in(&self, ns: u32, name: &str) -> Option<Link> {
        self.state()
            .links
            .iter()
            .find(|(n, l)| *n == ns && l.name == name)
            .map(|(_, l)| l.clone())
    }

    /// Namespace of the link called `name`, searching all namespaces.
    pub fn ns_of(&self, name: &str) -> Option<u32> {
        self.state()
            .links
            .iter()
            .find(|(_, l)| l.name == name)
            .map(|(n, _)| *n)
    }

    pub fn is_up(&self, name: &str) -> bool {
        let state = self.state();
        state
            .links
            .iter()
            .find(|(_, l)| l.name == name)
            .map(|(_, l)| state.up.contains(&l.index))
            .unwrap_or(false)
    }

    /// Overwrites the bridge VLANs of the port with `index`.
    pub fn set_port_vlans(&self, index: u32, vids: &[u16]) {
        let vlans = vids
            .iter()
            .map(|&vid| BridgeVlanInfo {
                vid,
                pvid: false,
                untagged: false,
            })
            .collect();
        self.state().vlans.insert(index, vlans);
    }

    pub fn port_vlans(&self, index: u32) -> Vec<BridgeVlanInfo> {
        self.state().vlans.get(&index).cloned().unwrap_or_default()
    }

    pub fn vids(&self, index: u32) -> Vec<u16> {
        let mut vids: Vec<u16> = self.port_vlans(index).iter().map(|v| v.vid).collect();
        vids.sort_unstable();
        vids
    }

    /// Every mutation applied so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }
}

impl LinkProvider for FakeNetlink {
    fn link_by_name(&self, name: &str) -> std::result::Result<Link, NetlinkError> {
        let state = self.state();
        let pos = state.check("link_by_name", name)?;
        Ok(state.links[pos].1.clone())
    }

    fn link_by_index(&self, index: u32) -> std::result::Result<Link, NetlinkError> {
        let state = self.state();
        state
            .links
            .iter()
            .find(|(n, l)| *n == state.current_ns && l.index == index)
            .map(|(_, l)| l.clone())
            .ok_or_else(|| NetlinkError::NotFound(format!("index {}", index)))
    }

    fn link_list(&self) -> std::result::Result<Vec<Link>, NetlinkError> {
        let state = self.state();
        Ok(state
            .links
            .iter()
            .filter(|(n, _)| *n == state.current_ns)
            .map(|(_, l)| l.clone())
            .collect())
    }

    fn set_up(&self, link: &Link) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_up", &link.name)?;
        let index = state.links[pos].1.index;
        state.up.insert(index);
        state.record(format!("set_up {}", link.name));
        Ok(())
    }

    fn set_down(&self, link: &Link) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_down", &link.name)?;
        let index = state.links[pos].1.index;
        state.up.remove(&index);
        state.record(format!("set_down {}", link.name));
        Ok(())
    }

    fn set_name(&self, link: &mut Link, name: &str) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_name", &link.name)?;
        state.links[pos].1.name = name.to_string();
        state.record(format!("set_name {} {}", link.name, name));
        link.name = name.to_string();
        Ok(())
    }

    fn set_ns_by_fd(&self, link: &mut Link, fd: RawFd) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_ns_by_fd", &link.name)?;
        let entry = &mut state.links[pos];
        entry.0 = fd as u32;
        entry.1.master_index = None;
        let index = entry.1.index;
        state.vlans.remove(&index);
        state.up.remove(&index);
        state.record(format!("set_ns_by_fd {} {}", link.name, fd));
        link.master_index = None;
        Ok(())
    }

    fn set_hardware_addr(&self, link: &mut Link, mac: MacAddr) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_hardware_addr", &link.name)?;
        state.links[pos].1.hardware_addr = Some(mac);
        state.record(format!("set_hardware_addr {} {}", link.name, mac));
        link.hardware_addr = Some(mac);
        Ok(())
    }

    fn set_mtu(&self, link: &mut Link, mtu: u32) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_mtu", &link.name)?;
        state.links[pos].1.mtu = mtu;
        state.record(format!("set_mtu {} {}", link.name, mtu));
        link.mtu = mtu;
        Ok(())
    }

    fn set_master(&self, link: &mut Link, master: &Link) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_master", &link.name)?;
        state.links[pos].1.master_index = Some(master.index);
        // a new bridge port starts with the default PVID
        let index = state.links[pos].1.index;
        if master.is_bridge() {
            state.vlans.insert(
                index,
                vec![BridgeVlanInfo {
                    vid: 1,
                    pvid: true,
                    untagged: true,
                }],
            );
        }
        state.record(format!("set_master {} {}", link.name, master.name));
        link.master_index = Some(master.index);
        Ok(())
    }

    fn set_no_master(&self, link: &mut Link) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("set_no_master", &link.name)?;
        state.links[pos].1.master_index = None;
        let index = state.links[pos].1.index;
        state.vlans.remove(&index);
        state.record(format!("set_no_master {}", link.name));
        link.master_index = None;
        Ok(())
    }

    fn set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: MacAddr) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        state.vf_mut("set_vf_hardware_addr", pf, vf)?.mac = Some(mac);
        state.record(format!("set_vf_hardware_addr {} {} {}", pf.name, vf, mac));
        Ok(())
    }

    fn set_vf_spoofchk(&self, pf: &Link, vf: u32, on: bool) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        state.vf_mut("set_vf_spoofchk", pf, vf)?.spoofchk = on;
        state.record(format!("set_vf_spoofchk {} {} {}", pf.name, vf, on));
        Ok(())
    }

    fn set_vf_trust(&self, pf: &Link, vf: u32, on: bool) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        state.vf_mut("set_vf_trust", pf, vf)?.trust = on;
        state.record(format!("set_vf_trust {} {} {}", pf.name, vf, on));
        Ok(())
    }

    fn set_vf_link_state(&self, pf: &Link, vf: u32, link_state: VfLinkState) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        state.vf_mut("set_vf_link_state", pf, vf)?.link_state = link_state;
        state.record(format!("set_vf_link_state {} {} {}", pf.name, vf, link_state));
        Ok(())
    }

    fn set_vf_rate(&self, pf: &Link, vf: u32, min_tx: u32, max_tx: u32) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let info = state.vf_mut("set_vf_rate", pf, vf)?;
        info.min_tx_rate = min_tx;
        info.max_tx_rate = max_tx;
        state.record(format!("set_vf_rate {} {} {} {}", pf.name, vf, min_tx, max_tx));
        Ok(())
    }

    fn bridge_vlan_add(&self, link: &Link, vlan: &BridgeVlan) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("bridge_vlan_add", &link.name)?;
        let index = state.links[pos].1.index;
        let port = state.vlans.entry(index).or_default();
        if vlan.pvid {
            port.iter_mut().for_each(|v| v.pvid = false);
        }
        port.retain(|v| v.vid != vlan.vid);
        port.push(BridgeVlanInfo {
            vid: vlan.vid,
            pvid: vlan.pvid,
            untagged: vlan.untagged,
        });
        state.record(format!(
            "bridge_vlan_add {} {}{}",
            link.name,
            vlan.vid,
            if vlan.pvid { " pvid" } else { "" }
        ));
        Ok(())
    }

    fn bridge_vlan_del(&self, link: &Link, vlan: &BridgeVlan) -> std::result::Result<(), NetlinkError> {
        let mut state = self.state();
        let pos = state.check("bridge_vlan_del", &link.name)?;
        let index = state.links[pos].1.index;
        if let Some(port) = state.vlans.get_mut(&index) {
            port.retain(|v| v.vid != vlan.vid);
        }
        state.record(format!("bridge_vlan_del {} {}", link.name, vlan.vid));
        Ok(())
    }

    fn bridge_vlan_list(&self) -> std::result::Result<HashMap<u32, Vec<BridgeVlanInfo>>, NetlinkError> {
        let state = self.state();
        let visible: HashSet<u32> = state
            .links
            .iter()
            .filter(|(n, _)| *n == state.current_ns)
            .map(|(_, l)| l.index)
            .collect();
        Ok(state
            .vlans
            .iter()
            .filter(|(index, _)| visible.contains(index))
            .map(|(index, vlans)| (*index, vlans.clone()))
            .collect())
    }
}

/// Namespace handle whose fd is the fake namespace id.
#[derive(Debug, Clone)]
pub struct FakeNetNs {
    id: u32,
    path: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeNetNs {
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl NetNs for FakeNetNs {
    fn fd(&self) -> RawFd {
        self.id as RawFd
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn run_in(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let origin = std::mem::replace(&mut self.state().current_ns, self.id);
        let result = f();
        self.state().current_ns = origin;
        result
    }
}

#[derive(Debug, Clone)]
pub struct FakeNamespaces {
    state: Arc<Mutex<HostState>>,
}

impl Namespaces for FakeNamespaces {
    fn get_ns(&self, path: &str) -> std::result::Result<Arc<dyn NetNs>, NsError> {
        let id = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .namespaces
            .get(path)
            .copied()
            .ok_or_else(|| NsError::PathNotExist(path.to_string()))?;
        Ok(Arc::new(FakeNetNs {
            id,
            path: path.to_string(),
            state: self.state.clone(),
        }))
    }

    fn current(&self) -> std::result::Result<Arc<dyn NetNs>, NsError> {
        let id = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_ns;
        Ok(Arc::new(FakeNetNs {
            id,
            path: format!("/proc/fake/ns/{}", id),
            state: self.state.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
struct FakeVf {
    pf: String,
    vf_id: u32,
    netdev: Option<String>,
    userspace: bool,
}

/// Device introspection answered from a table.
#[derive(Debug, Clone, Default)]
pub struct FakeIntrospection {
    vfs: HashMap<String, FakeVf>,
    representors: HashMap<(String, u32), String>,
}

impl FakeIntrospection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a kernel-driver VF with its host netdevice and representor.
    pub fn with_vf(mut self, pci: &str, pf: &str, vf_id: u32, netdev: &str, representor: &str) -> Self {
        self.vfs.insert(
            pci.to_string(),
            FakeVf {
                pf: pf.to_string(),
                vf_id,
                netdev: Some(netdev.to_string()),
                userspace: false,
            },
        );
        self.representors
            .insert((pf.to_string(), vf_id), representor.to_string());
        self
    }

    /// Declares a VF bound to a userspace driver.
    pub fn with_userspace_vf(mut self, pci: &str, pf: &str, vf_id: u32, representor: &str) -> Self {
        self.vfs.insert(
            pci.to_string(),
            FakeVf {
                pf: pf.to_string(),
                vf_id,
                netdev: None,
                userspace: true,
            },
        );
        self.representors
            .insert((pf.to_string(), vf_id), representor.to_string());
        self
    }

    fn vf(&self, pci: &str) -> Result<&FakeVf> {
        self.vfs
            .get(pci)
            .ok_or_else(|| Error::introspection(pci, "no such device"))
    }
}

impl DeviceIntrospection for FakeIntrospection {
    fn uplink_name_for_vf(&self, pci: &str) -> Result<String> {
        Ok(self.vf(pci)?.pf.clone())
    }

    fn vf_index(&self, pci: &str, pf: &str) -> Result<u32> {
        let vf = self.vf(pci)?;
        if vf.pf != pf {
            return Err(Error::introspection(pci, format!("not a VF of {}", pf)));
        }
        Ok(vf.vf_id)
    }

    fn vf_netdev_name(&self, pci: &str) -> Result<String> {
        self.vf(pci)?
            .netdev
            .clone()
            .ok_or_else(|| Error::introspection(pci, "no netdevice"))
    }

    fn has_userspace_driver(&self, pci: &str) -> Result<bool> {
        Ok(self.vf(pci)?.userspace)
    }

    fn representor_name_for_vf(&self, pf: &str, vf: u32) -> Result<String> {
        self.representors
            .get(&(pf.to_string(), vf))
            .cloned()
            .ok_or_else(|| Error::introspection(pf, format!("failed to find representor for VF {}", vf)))
    }
}

/// Lock that counts acquisitions and releases.
#[derive(Debug, Default)]
pub struct FakeLock {
    locks: AtomicUsize,
    unlocks: AtomicUsize,
    held: AtomicBool,
}

impl FakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl IpcLock for FakeLock {
    fn lock(&self) -> Result<()> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        if self.held.swap(false, Ordering::SeqCst) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// State cache kept in memory.
#[derive(Debug, Default)]
pub struct MemStateCache {
    records: Mutex<HashMap<String, PluginConf>>,
}

impl MemStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, PluginConf>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get(&self, state_ref: &str) -> Option<PluginConf> {
        self.records().get(state_ref).cloned()
    }
}

impl StateCache for MemStateCache {
    fn save(&self, state_ref: &str, conf: &PluginConf) -> anyhow::Result<()> {
        self.records().insert(state_ref.to_string(), conf.clone());
        Ok(())
    }

    fn load(&self, state_ref: &str) -> anyhow::Result<PluginConf> {
        match self.records().get(state_ref) {
            Some(conf) => Ok(conf.clone()),
            None => bail!("no cached record {}", state_ref),
        }
    }

    fn delete(&self, state_ref: &str) -> anyhow::Result<()> {
        self.records().remove(state_ref);
        Ok(())
    }
}

/// IPAM returning a canned result and recording calls.
#[derive(Debug, Default)]
pub struct FakeIpam {
    result: CniResult,
    fail_add: bool,
    fail_del: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeIpam {
    pub fn new(result: CniResult) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn failing_add(mut self) -> Self {
        self.fail_add = true;
        self
    }

    pub fn failing_del(mut self) -> Self {
        self.fail_del = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

impl Ipam for FakeIpam {
    fn exec_add(&self, plugin: &str, _netconf: &[u8]) -> anyhow::Result<CniResult> {
        self.record(format!("add {}", plugin));
        if self.fail_add {
            bail!("IPAM plugin {} ADD failed", plugin);
        }
        Ok(self.result.clone())
    }

    fn exec_del(&self, plugin: &str, _netconf: &[u8]) -> anyhow::Result<()> {
        self.record(format!("del {}", plugin));
        if self.fail_del {
            bail!("IPAM plugin {} DEL failed", plugin);
        }
        Ok(())
    }

    fn configure_iface(&self, ifname: &str, _result: &CniResult) -> anyhow::Result<()> {
        self.record(format!("configure {}", ifname));
        Ok(())
    }
}
