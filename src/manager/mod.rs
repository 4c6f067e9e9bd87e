//! VF and representor lifecycle.
//!
//! The manager keeps no state between calls: everything it learns or needs to
//! undo later is recorded in the [`PluginConf`] it is handed.

use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lock::{IpcLock, LockGuard};
use crate::netlink::{BridgeVlan, Link, LinkProvider};
use crate::netns::{Namespaces, NetNs};
use crate::sriov::DeviceIntrospection;
use crate::types::PluginConf;
use crate::uplink;

/// Kernel-side operations the orchestrator sequences for ADD and DEL.
pub trait Manager {
    /// Attaches the VF representor to the bridge and programs its VLANs.
    fn attach_representor(&self, conf: &mut PluginConf) -> Result<()>;
    fn detach_representor(&self, conf: &PluginConf) -> Result<()>;
    /// Applies PF-level VF settings, capturing what they replace.
    fn apply_vf_config(&self, conf: &mut PluginConf) -> Result<()>;
    fn reset_vf_config(&self, conf: &PluginConf) -> Result<()>;
    /// Moves the VF netdevice into `netns` as `podif`; returns its MAC.
    fn setup_vf(
        &self,
        conf: &mut PluginConf,
        podif: &str,
        cid: &str,
        netns: &dyn NetNs,
    ) -> Result<String>;
    /// Moves the VF back to the caller's namespace under its host name.
    fn release_vf(&self, conf: &PluginConf, podif: &str, cid: &str, netns: &dyn NetNs)
        -> Result<()>;
}

pub struct VfManager {
    nlink: Arc<dyn LinkProvider>,
    sriov: Arc<dyn DeviceIntrospection>,
    namespaces: Arc<dyn Namespaces>,
    lock: Arc<dyn IpcLock>,
}

impl VfManager {
    pub fn new(
        nlink: Arc<dyn LinkProvider>,
        sriov: Arc<dyn DeviceIntrospection>,
        namespaces: Arc<dyn Namespaces>,
        lock: Arc<dyn IpcLock>,
    ) -> Self {
        Self {
            nlink,
            sriov,
            namespaces,
            lock,
        }
    }

    fn link_by_name(&self, op: &'static str, name: &str) -> Result<Link> {
        self.nlink.link_by_name(name).map_err(Error::link(op, name))
    }

    fn program_port_vlans(&self, conf: &PluginConf, rep: &Link) -> Result<()> {
        // an explicit VLAN role replaces the bridge default PVID
        if conf.vlan > 1 || !conf.trunk.is_empty() {
            debug!(rep = %rep.name, "removing default PVID 1");
            self.nlink
                .bridge_vlan_del(rep, &BridgeVlan::pvid(1))
                .map_err(Error::link("remove default vlan from", &rep.name))?;
        }

        for &vid in &conf.trunk {
            self.nlink
                .bridge_vlan_add(rep, &BridgeVlan::tagged(vid))
                .map_err(Error::link("add trunk vlan to", &rep.name))?;
        }
        if !conf.trunk.is_empty() {
            debug!(rep = %rep.name, trunk = %conf.trunk.iter().join(","), "trunk VLANs added");
        }

        if conf.vlan > 0 {
            debug!(rep = %rep.name, vlan = conf.vlan, "setting PVID");
            self.nlink
                .bridge_vlan_add(rep, &BridgeVlan::pvid(conf.vlan))
                .map_err(Error::link("set pvid on", &rep.name))?;
        }

        if conf.set_uplink_vlan() {
            self.add_uplink_vlans(conf)?;
        }
        Ok(())
    }

    fn uplink_for(&self, conf: &PluginConf) -> Result<(Link, Link)> {
        let pf = self.link_by_name("find PF", &conf.pf_name)?;
        let uplink = uplink::resolve_uplink(self.nlink.as_ref(), &pf)?;
        Ok((pf, uplink))
    }

    fn add_uplink_vlans(&self, conf: &PluginConf) -> Result<()> {
        let (_, uplink) = self.uplink_for(conf)?;
        let vlans = conf.uplink_vlans();
        if vlans.is_empty() {
            return Ok(());
        }

        let _guard = LockGuard::acquire(self.lock.as_ref())?;
        for (i, &vid) in vlans.iter().enumerate() {
            if let Err(e) = self.nlink.bridge_vlan_add(&uplink, &BridgeVlan::tagged(vid)) {
                if i > 0 {
                    warn!(
                        uplink = %uplink.name,
                        vlans = %vlans[..i].iter().join(","),
                        "leaving uplink VLANs added before the failure"
                    );
                }
                return Err(Error::link("add vlan to uplink", &uplink.name)(e));
            }
        }
        info!(uplink = %uplink.name, vlans = %vlans.iter().join(","), "added uplink VLANs");
        Ok(())
    }

    fn delete_uplink_vlans(&self, conf: &PluginConf) -> Result<()> {
        let (pf, uplink) = self.uplink_for(conf)?;
        let bridge = uplink::resolve_parent_bridge(self.nlink.as_ref(), &pf)?;
        let candidates = conf.uplink_vlans();
        if candidates.is_empty() {
            return Ok(());
        }

        // the scan must see the same membership the deletes act on
        let _guard = LockGuard::acquire(self.lock.as_ref())?;
        let links = self
            .nlink
            .link_list()
            .map_err(Error::link("list members of", &bridge.name))?;
        let members = uplink::bridge_members(&links, &bridge, &uplink);
        let membership = self
            .nlink
            .bridge_vlan_list()
            .map_err(Error::link("list vlans of", &bridge.name))?;

        let unused = uplink::unused_vlans(&candidates, &members, &membership);
        for &vid in &unused {
            self.nlink
                .bridge_vlan_del(&uplink, &BridgeVlan::tagged(vid))
                .map_err(Error::link("remove vlan from uplink", &uplink.name))?;
        }
        info!(
            uplink = %uplink.name,
            removed = %unused.iter().join(","),
            kept = candidates.len() - unused.len(),
            "removed unused uplink VLANs"
        );
        Ok(())
    }
}

impl Manager for VfManager {
    fn attach_representor(&self, conf: &mut PluginConf) -> Result<()> {
        let bridge = self.link_by_name("get bridge link", &conf.actual_bridge)?;

        conf.representor = self
            .sriov
            .representor_name_for_vf(&conf.pf_name, conf.vf_id)?;
        let mut rep = self.link_by_name("get representor link", &conf.representor)?;

        if let Some(mtu) = conf.mtu() {
            conf.orig_rep_state.capture_mtu(rep.mtu);
            debug!(rep = %rep.name, mtu, "setting representor MTU");
            self.nlink
                .set_mtu(&mut rep, mtu)
                .map_err(Error::link("set mtu on representor", &rep.name))?;
        }

        self.nlink
            .set_up(&rep)
            .map_err(Error::link("set up representor", &rep.name))?;

        info!(rep = %rep.name, bridge = %bridge.name, "attaching representor to bridge");
        self.nlink
            .set_master(&mut rep, &bridge)
            .map_err(Error::link("attach representor", &rep.name))?;

        if let Err(e) = self.program_port_vlans(conf, &rep) {
            if let Err(undo) = self.nlink.set_no_master(&mut rep) {
                warn!(rep = %rep.name, error = %undo, "failed to detach representor after VLAN failure");
            }
            return Err(e);
        }
        Ok(())
    }

    fn detach_representor(&self, conf: &PluginConf) -> Result<()> {
        let mut rep = self.link_by_name("get representor link", &conf.representor)?;

        self.nlink
            .set_down(&rep)
            .map_err(Error::link("set down representor", &rep.name))?;

        if conf.mtu().is_some() {
            if let Some(mtu) = conf.orig_rep_state.mtu {
                debug!(rep = %rep.name, mtu, "restoring representor MTU");
                self.nlink
                    .set_mtu(&mut rep, mtu)
                    .map_err(Error::link("restore mtu on representor", &rep.name))?;
            }
        }

        info!(rep = %rep.name, bridge = %conf.actual_bridge, "detaching representor from bridge");
        self.nlink
            .set_no_master(&mut rep)
            .map_err(Error::link("detach representor", &rep.name))?;

        if conf.set_uplink_vlan() {
            if let Err(e) = self.delete_uplink_vlans(conf) {
                warn!(pf = %conf.pf_name, error = %e, "failed to remove uplink VLANs");
            }
        }
        Ok(())
    }

    fn apply_vf_config(&self, conf: &mut PluginConf) -> Result<()> {
        let pf = self.link_by_name("lookup PF", &conf.pf_name)?;
        let vf = conf.vf_id;
        let info = pf.vf(vf).ok_or_else(|| Error::VfNotFound {
            pf: pf.name.clone(),
            vf,
        })?;
        conf.orig_vf_state.fill_from_vf_info(info);

        if let Some(mac) = conf.mac {
            debug!(pf = %pf.name, vf, %mac, "setting VF administrative MAC");
            self.nlink
                .set_vf_hardware_addr(&pf, vf, mac)
                .map_err(Error::link("set vf mac on", &pf.name))?;
        }

        let net_conf = &conf.net_conf;
        // 0 means no limit
        if net_conf.min_tx_rate.is_some() || net_conf.max_tx_rate.is_some() {
            let min = net_conf.min_tx_rate.unwrap_or(0);
            let max = net_conf.max_tx_rate.unwrap_or(0);
            self.nlink
                .set_vf_rate(&pf, vf, min, max)
                .map_err(Error::link("set vf tx rate on", &pf.name))?;
        }
        if let Some(spoofchk) = net_conf.spoofchk {
            self.nlink
                .set_vf_spoofchk(&pf, vf, spoofchk.is_on())
                .map_err(Error::link("set vf spoofchk on", &pf.name))?;
        }
        if let Some(trust) = net_conf.trust {
            self.nlink
                .set_vf_trust(&pf, vf, trust.is_on())
                .map_err(Error::link("set vf trust on", &pf.name))?;
        }
        if let Some(state) = net_conf.link_state {
            self.nlink
                .set_vf_link_state(&pf, vf, state)
                .map_err(Error::link("set vf link state on", &pf.name))?;
        }
        Ok(())
    }

    fn reset_vf_config(&self, conf: &PluginConf) -> Result<()> {
        let pf = self.link_by_name("lookup PF", &conf.pf_name)?;
        let vf = conf.vf_id;
        let orig = &conf.orig_vf_state;
        let net_conf = &conf.net_conf;

        if net_conf.spoofchk.is_some() {
            self.nlink
                .set_vf_spoofchk(&pf, vf, orig.spoofchk.unwrap_or(true))
                .map_err(Error::link("restore vf spoofchk on", &pf.name))?;
        }

        if conf.mac.is_some() {
            match orig.admin_mac {
                Some(mac) => {
                    debug!(pf = %pf.name, vf, %mac, "restoring VF administrative MAC");
                    self.nlink
                        .set_vf_hardware_addr(&pf, vf, mac)
                        .map_err(Error::link("restore vf mac on", &pf.name))?;
                }
                None => warn!(pf = %pf.name, vf, "no original administrative MAC recorded"),
            }
        }

        if net_conf.trust.is_some() {
            self.nlink
                .set_vf_trust(&pf, vf, orig.trust.unwrap_or(false))
                .map_err(Error::link("restore vf trust on", &pf.name))?;
        }

        if net_conf.min_tx_rate.is_some() || net_conf.max_tx_rate.is_some() {
            self.nlink
                .set_vf_rate(
                    &pf,
                    vf,
                    orig.min_tx_rate.unwrap_or(0),
                    orig.max_tx_rate.unwrap_or(0),
                )
                .map_err(Error::link("restore vf tx rate on", &pf.name))?;
        }

        // only touched when configured, some drivers reject the call
        if net_conf.link_state.is_some() {
            if let Some(state) = orig.link_state {
                self.nlink
                    .set_vf_link_state(&pf, vf, state)
                    .map_err(Error::link("restore vf link state on", &pf.name))?;
            }
        }
        Ok(())
    }

    fn setup_vf(
        &self,
        conf: &mut PluginConf,
        podif: &str,
        cid: &str,
        netns: &dyn NetNs,
    ) -> Result<String> {
        let host_name = conf.orig_vf_state.host_if_name.clone();
        let mut link = self.link_by_name("get VF netdevice", &host_name)?;

        // rename first so the pod name can't clash with another host device
        let temp_name = format!("temp_{}", link.index);

        self.nlink
            .set_down(&link)
            .map_err(Error::link("set down VF", &host_name))?;
        self.nlink
            .set_name(&mut link, &temp_name)
            .map_err(Error::link("set temporary name on VF", &host_name))?;

        if let Some(mac) = conf.mac {
            if let Some(current) = link.hardware_addr {
                conf.orig_vf_state.capture_effective_mac(current);
            }
            self.nlink
                .set_hardware_addr(&mut link, mac)
                .map_err(Error::link("set mac on VF", &temp_name))?;
        }

        if let Some(mtu) = conf.mtu() {
            conf.orig_vf_state.capture_mtu(link.mtu);
            self.nlink
                .set_mtu(&mut link, mtu)
                .map_err(Error::link("set mtu on VF", &temp_name))?;
        }

        debug!(vf = %temp_name, netns = netns.path(), container = cid, "moving VF to pod namespace");
        self.nlink
            .set_ns_by_fd(&mut link, netns.fd())
            .map_err(Error::link("move to pod namespace", &temp_name))?;

        let nlink = self.nlink.as_ref();
        let mut mac = String::new();
        netns.run_in(&mut || {
            nlink
                .set_name(&mut link, podif)
                .map_err(Error::link("set pod interface name on", &temp_name))?;
            nlink
                .set_up(&link)
                .map_err(Error::link("set up", podif))?;
            mac = link
                .hardware_addr
                .map(|m| m.to_string())
                .unwrap_or_default();
            Ok(())
        })?;

        conf.cont_if_name = podif.to_string();
        Ok(mac)
    }

    fn release_vf(
        &self,
        conf: &PluginConf,
        podif: &str,
        cid: &str,
        netns: &dyn NetNs,
    ) -> Result<()> {
        let init_ns = self.namespaces.current()?;
        let host_name = conf.orig_vf_state.host_if_name.as_str();
        let nlink = self.nlink.as_ref();

        debug!(vf = podif, netns = netns.path(), container = cid, "releasing VF");
        netns.run_in(&mut || {
            let mut link = nlink
                .link_by_name(podif)
                .map_err(Error::link("get pod interface", podif))?;
            nlink
                .set_down(&link)
                .map_err(Error::link("set down", podif))?;
            nlink
                .set_name(&mut link, host_name)
                .map_err(Error::link("restore host name on", podif))?;

            if conf.mac.is_some() {
                if let Some(mac) = conf.orig_vf_state.effective_mac {
                    nlink
                        .set_hardware_addr(&mut link, mac)
                        .map_err(Error::link("restore effective mac on", host_name))?;
                }
            }
            if conf.mtu().is_some() {
                if let Some(mtu) = conf.orig_vf_state.mtu {
                    nlink
                        .set_mtu(&mut link, mtu)
                        .map_err(Error::link("restore mtu on", host_name))?;
                }
            }

            nlink
                .set_ns_by_fd(&mut link, init_ns.fd())
                .map_err(Error::link("move to init namespace", host_name))?;
            Ok(())
        })
    }
}
