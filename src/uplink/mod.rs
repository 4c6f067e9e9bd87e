//! Uplink and parent bridge resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::netlink::{BridgeVlanInfo, Link, LinkProvider};

/// The link VLANs are programmed on for `pf`: its bond if it is a bond slave,
/// the PF itself otherwise.
pub fn resolve_uplink(nlink: &dyn LinkProvider, pf: &Link) -> Result<Link> {
    match parent_bond(nlink, pf) {
        Ok(bond) => Ok(bond),
        Err(Error::NoParentBond { .. }) => Ok(pf.clone()),
        Err(e) => Err(e),
    }
}

/// The bond `link` is enslaved to.
pub fn parent_bond(nlink: &dyn LinkProvider, link: &Link) -> Result<Link> {
    let no_bond = || Error::NoParentBond {
        link: link.name.clone(),
    };
    let index = link.master_index.ok_or_else(no_bond)?;
    let master = nlink
        .link_by_index(index)
        .map_err(Error::link("find master of", &link.name))?;
    if master.is_bond() {
        Ok(master)
    } else {
        Err(no_bond())
    }
}

/// The bridge `link` is attached to, directly or through one bond.
pub fn resolve_parent_bridge(nlink: &dyn LinkProvider, link: &Link) -> Result<Link> {
    let master = master_of(nlink, link)?;
    if master.is_bridge() {
        return Ok(master);
    }
    if !master.is_bond() {
        return Err(Error::NoParentBridge {
            link: link.name.clone(),
            reason: format!("master {} is neither a bridge nor a bond", master.name),
        });
    }

    let upper_index = master.master_index.ok_or_else(|| Error::NoParentBridge {
        link: link.name.clone(),
        reason: format!("bond {} has no master", master.name),
    })?;
    let upper = nlink
        .link_by_index(upper_index)
        .map_err(Error::link("find master of", &master.name))?;
    if upper.is_bridge() {
        Ok(upper)
    } else {
        Err(Error::NoParentBridge {
            link: link.name.clone(),
            reason: format!("master {} of bond {} is not a bridge", upper.name, master.name),
        })
    }
}

fn master_of(nlink: &dyn LinkProvider, link: &Link) -> Result<Link> {
    let index = link.master_index.ok_or_else(|| Error::NoParentBridge {
        link: link.name.clone(),
        reason: "link has no master".to_string(),
    })?;
    nlink
        .link_by_index(index)
        .map_err(Error::link("find master of", &link.name))
}

/// Members of `bridge` other than `exclude`.
pub fn bridge_members(links: &[Link], bridge: &Link, exclude: &Link) -> Vec<Link> {
    links
        .iter()
        .filter(|l| l.master_index == Some(bridge.index) && l.index != exclude.index)
        .cloned()
        .collect()
}

/// The subset of `candidates` that no member in `members` carries.
///
/// VLANs still in use by another bridge port must stay on the uplink.
pub fn unused_vlans(
    candidates: &[u16],
    members: &[Link],
    membership: &HashMap<u32, Vec<BridgeVlanInfo>>,
) -> Vec<u16> {
    let in_use: BTreeSet<u16> = members
        .iter()
        .filter_map(|m| membership.get(&m.index))
        .flatten()
        .map(|v| v.vid)
        .collect();
    candidates
        .iter()
        .copied()
        .filter(|vid| !in_use.contains(vid))
        .collect()
}

/// Which members carry each VLAN, keyed by VLAN id.
pub fn vlan_users(
    members: &[Link],
    membership: &HashMap<u32, Vec<BridgeVlanInfo>>,
) -> BTreeMap<u16, Vec<String>> {
    let mut users: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for member in members {
        for vlan in membership.get(&member.index).into_iter().flatten() {
            users.entry(vlan.vid).or_default().push(member.name.clone());
        }
    }
    users
}
