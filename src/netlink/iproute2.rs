use serde::Deserialize;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::process::Command;
use tracing::debug;

use super::{
    BridgeVlan, BridgeVlanInfo, Link, LinkKind, LinkProvider, NetlinkError, VfInfo, VfLinkState,
};
use crate::types::MacAddr;

/// Link provider backed by the iproute2 `ip` and `bridge` tools.
///
/// Child processes inherit the network namespace of the calling thread, so
/// calls made from inside [`crate::netns::NetNs::run_in`] act on that
/// namespace.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    ip: String,
    bridge: String,
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self {
            ip: "ip".to_string(),
            bridge: "bridge".to_string(),
        }
    }

    fn ip(&self, args: &[&str]) -> Result<Vec<u8>, NetlinkError> {
        run(&self.ip, args)
    }

    fn bridge(&self, args: &[&str]) -> Result<Vec<u8>, NetlinkError> {
        run(&self.bridge, args)
    }

    fn link_set(&self, dev: &str, args: &[&str]) -> Result<(), NetlinkError> {
        let mut full = vec!["link", "set", "dev", dev];
        full.extend_from_slice(args);
        self.ip(&full).map(|_| ())
    }

    fn vf_set(&self, pf: &Link, vf: u32, args: &[&str]) -> Result<(), NetlinkError> {
        let vf = vf.to_string();
        let mut full = vec!["vf", vf.as_str()];
        full.extend_from_slice(args);
        self.link_set(&pf.name, &full)
    }

    pub fn link_set_up(&self, dev: &str) -> Result<(), NetlinkError> {
        self.link_set(dev, &["up"])
    }

    /// Adds an address given in CIDR notation to `dev`.
    pub fn addr_add(&self, dev: &str, cidr: &str) -> Result<(), NetlinkError> {
        self.ip(&["addr", "add", cidr, "dev", dev]).map(|_| ())
    }

    pub fn route_add(&self, dst: &str, gw: Option<&str>, dev: &str) -> Result<(), NetlinkError> {
        let mut args = vec!["route", "add", dst];
        if let Some(gw) = gw {
            args.extend_from_slice(&["via", gw]);
        }
        args.extend_from_slice(&["dev", dev]);
        self.ip(&args).map(|_| ())
    }

    fn bridge_vlan(&self, action: &str, link: &Link, vlan: &BridgeVlan) -> Result<(), NetlinkError> {
        let vid = vlan.vid.to_string();
        let mut args = vec!["vlan", action, "dev", link.name.as_str(), "vid", vid.as_str()];
        if vlan.pvid {
            args.push("pvid");
        }
        if vlan.untagged {
            args.push("untagged");
        }
        if vlan.on_self {
            args.push("self");
        }
        if vlan.on_master {
            args.push("master");
        }
        self.bridge(&args).map(|_| ())
    }
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new()
    }
}

fn run(program: &str, args: &[&str]) -> Result<Vec<u8>, NetlinkError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(%command, "running");

    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
        let dev = args
            .iter()
            .position(|a| *a == "dev")
            .and_then(|i| args.get(i + 1))
            .copied()
            .unwrap_or_default();
        return Err(NetlinkError::NotFound(dev.to_string()));
    }
    Err(NetlinkError::Command {
        command,
        status: output.status.code(),
        stderr,
    })
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    vfinfo_list: Vec<IpVfInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpVfInfo {
    vf: u32,
    #[serde(default, alias = "mac")]
    address: Option<String>,
    #[serde(default)]
    spoofchk: Option<bool>,
    #[serde(default)]
    trust: Option<bool>,
    #[serde(default)]
    link_state: Option<VfLinkState>,
    #[serde(default)]
    rate: Option<IpVfRate>,
}

#[derive(Debug, Deserialize)]
struct IpVfRate {
    #[serde(default)]
    max_tx: u32,
    #[serde(default)]
    min_tx: u32,
}

#[derive(Debug, Deserialize)]
struct BridgeVlanPort {
    ifname: String,
    #[serde(default)]
    vlans: Vec<BridgeVlanEntry>,
}

#[derive(Debug, Deserialize)]
struct BridgeVlanEntry {
    vlan: u16,
    #[serde(default, rename = "vlanEnd")]
    vlan_end: Option<u16>,
    #[serde(default)]
    flags: Vec<String>,
}

impl From<IpVfInfo> for VfInfo {
    fn from(raw: IpVfInfo) -> Self {
        let mut vf = VfInfo::new(raw.vf);
        vf.mac = raw.address.and_then(|a| a.parse().ok());
        if let Some(spoofchk) = raw.spoofchk {
            vf.spoofchk = spoofchk;
        }
        if let Some(trust) = raw.trust {
            vf.trust = trust;
        }
        if let Some(state) = raw.link_state {
            vf.link_state = state;
        }
        if let Some(rate) = raw.rate {
            vf.min_tx_rate = rate.min_tx;
            vf.max_tx_rate = rate.max_tx;
        }
        vf
    }
}

fn parse_links(json: &[u8]) -> Result<Vec<Link>, NetlinkError> {
    let raw: Vec<IpLink> = serde_json::from_slice(json)?;
    let indices: HashMap<String, u32> = raw
        .iter()
        .map(|l| (l.ifname.clone(), l.ifindex))
        .collect();

    Ok(raw
        .into_iter()
        .map(|l| {
            let kind = match l.linkinfo.and_then(|i| i.info_kind).as_deref() {
                Some("bridge") => LinkKind::Bridge,
                Some("bond") => LinkKind::Bond,
                Some(other) => LinkKind::Other(other.to_string()),
                None => LinkKind::Other("device".to_string()),
            };
            Link {
                index: l.ifindex,
                master_index: l.master.as_ref().and_then(|m| indices.get(m).copied()),
                name: l.ifname,
                kind,
                mtu: l.mtu,
                hardware_addr: l.address.and_then(|a| a.parse::<MacAddr>().ok()),
                vfs: l.vfinfo_list.into_iter().map(VfInfo::from).collect(),
            }
        })
        .collect())
}

fn parse_bridge_vlans(
    json: &[u8],
    links: &[Link],
) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>, NetlinkError> {
    let ports: Vec<BridgeVlanPort> = serde_json::from_slice(json)?;
    let mut out: HashMap<u32, Vec<BridgeVlanInfo>> = HashMap::new();
    for port in ports {
        let Some(link) = links.iter().find(|l| l.name == port.ifname) else {
            continue;
        };
        let entry = out.entry(link.index).or_default();
        for v in port.vlans {
            let pvid = v.flags.iter().any(|f| f == "PVID");
            let untagged = v.flags.iter().any(|f| f == "Egress Untagged");
            for vid in v.vlan..=v.vlan_end.unwrap_or(v.vlan) {
                entry.push(BridgeVlanInfo { vid, pvid, untagged });
            }
        }
    }
    Ok(out)
}

impl LinkProvider for IpRoute2 {
    fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        self.link_list()?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| NetlinkError::NotFound(name.to_string()))
    }

    fn link_by_index(&self, index: u32) -> Result<Link, NetlinkError> {
        self.link_list()?
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| NetlinkError::NotFound(format!("index {}", index)))
    }

    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        let out = self.ip(&["-d", "-j", "link", "show"])?;
        parse_links(&out)
    }

    fn set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["up"])
    }

    fn set_down(&self, link: &Link) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["down"])
    }

    fn set_name(&self, link: &mut Link, name: &str) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["name", name])?;
        link.name = name.to_string();
        Ok(())
    }

    fn set_ns_by_fd(&self, link: &mut Link, fd: RawFd) -> Result<(), NetlinkError> {
        // the child can't see our descriptor table directly, address it through procfs
        let target = format!("/proc/{}/fd/{}", std::process::id(), fd);
        self.link_set(&link.name, &["netns", &target])?;
        link.master_index = None;
        Ok(())
    }

    fn set_hardware_addr(&self, link: &mut Link, mac: MacAddr) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["address", &mac.to_string()])?;
        link.hardware_addr = Some(mac);
        Ok(())
    }

    fn set_mtu(&self, link: &mut Link, mtu: u32) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["mtu", &mtu.to_string()])?;
        link.mtu = mtu;
        Ok(())
    }

    fn set_master(&self, link: &mut Link, master: &Link) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["master", &master.name])?;
        link.master_index = Some(master.index);
        Ok(())
    }

    fn set_no_master(&self, link: &mut Link) -> Result<(), NetlinkError> {
        self.link_set(&link.name, &["nomaster"])?;
        link.master_index = None;
        Ok(())
    }

    fn set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: MacAddr) -> Result<(), NetlinkError> {
        self.vf_set(pf, vf, &["mac", &mac.to_string()])
    }

    fn set_vf_spoofchk(&self, pf: &Link, vf: u32, on: bool) -> Result<(), NetlinkError> {
        self.vf_set(pf, vf, &["spoofchk", on_off(on)])
    }

    fn set_vf_trust(&self, pf: &Link, vf: u32, on: bool) -> Result<(), NetlinkError> {
        self.vf_set(pf, vf, &["trust", on_off(on)])
    }

    fn set_vf_link_state(&self, pf: &Link, vf: u32, state: VfLinkState) -> Result<(), NetlinkError> {
        self.vf_set(pf, vf, &["state", state.as_str()])
    }

    fn set_vf_rate(&self, pf: &Link, vf: u32, min_tx: u32, max_tx: u32) -> Result<(), NetlinkError> {
        let min_tx = min_tx.to_string();
        let max_tx = max_tx.to_string();
        self.vf_set(pf, vf, &["min_tx_rate", &min_tx, "max_tx_rate", &max_tx])
    }

    fn bridge_vlan_add(&self, link: &Link, vlan: &BridgeVlan) -> Result<(), NetlinkError> {
        self.bridge_vlan("add", link, vlan)
    }

    fn bridge_vlan_del(&self, link: &Link, vlan: &BridgeVlan) -> Result<(), NetlinkError> {
        self.bridge_vlan("del", link, vlan)
    }

    fn bridge_vlan_list(&self) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>, NetlinkError> {
        let links = self.link_list()?;
        let out = self.bridge(&["-j", "vlan", "show"])?;
        parse_bridge_vlans(&out, &links)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_link_json() {
        let json = br#"[
            {"ifindex":1,"ifname":"lo","mtu":65536,"address":"00:00:00:00:00:00"},
            {"ifindex":5,"ifname":"br0","mtu":1500,"address":"aa:bb:cc:00:00:01",
             "linkinfo":{"info_kind":"bridge"}},
            {"ifindex":6,"ifname":"bond0","mtu":9000,"master":"br0",
             "linkinfo":{"info_kind":"bond"}},
            {"ifindex":7,"ifname":"enp1s0f0","mtu":9000,"master":"bond0",
             "vfinfo_list":[{"vf":0,"address":"02:00:00:00:00:07","spoofchk":false,
                             "trust":true,"link_state":"enable",
                             "rate":{"max_tx":100,"min_tx":10}}]}
        ]"#;
        let links = parse_links(json).unwrap();
        assert_eq!(links.len(), 4);
        assert!(links[1].is_bridge());
        assert!(links[2].is_bond());
        assert_eq!(links[2].master_index, Some(5));
        assert_eq!(links[3].master_index, Some(6));

        let vf = links[3].vf(0).unwrap();
        assert_eq!(vf.mac.unwrap().to_string(), "02:00:00:00:00:07");
        assert!(!vf.spoofchk);
        assert!(vf.trust);
        assert_eq!(vf.link_state, VfLinkState::Enable);
        assert_eq!((vf.min_tx_rate, vf.max_tx_rate), (10, 100));
    }

    #[test]
    fn parses_bridge_vlan_ranges_and_flags() {
        let links = vec![Link::new(7, "rep0"), Link::new(8, "rep1")];
        let json = br#"[
            {"ifname":"rep0","vlans":[{"vlan":10,"flags":["PVID","Egress Untagged"]},
                                      {"vlan":20,"vlanEnd":22}]},
            {"ifname":"unknown","vlans":[{"vlan":1}]}
        ]"#;
        let vlans = parse_bridge_vlans(json, &links).unwrap();
        let rep0 = &vlans[&7];
        assert_eq!(rep0.len(), 4);
        assert!(rep0[0].pvid && rep0[0].untagged);
        assert_eq!(rep0.iter().map(|v| v.vid).collect::<Vec<_>>(), vec![10, 20, 21, 22]);
        assert!(!vlans.contains_key(&8));
    }
}
