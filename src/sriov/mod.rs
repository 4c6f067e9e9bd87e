//! SR-IOV device introspection through sysfs.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Drivers whose devices have no netdevice.
pub const USERSPACE_DRIVERS: &[&str] = &["vfio-pci"];

/// Resolves VFs to their PF, netdevice and switchdev representor.
pub trait DeviceIntrospection {
    /// Name of the PF netdevice owning the VF at `pci`.
    fn uplink_name_for_vf(&self, pci: &str) -> Result<String>;
    /// Index of the VF at `pci` among the VFs of `pf`.
    fn vf_index(&self, pci: &str, pf: &str) -> Result<u32>;
    /// Host netdevice name of the VF at `pci`.
    fn vf_netdev_name(&self, pci: &str) -> Result<String>;
    fn has_userspace_driver(&self, pci: &str) -> Result<bool>;
    /// Representor netdevice of VF `vf` of `pf`.
    fn representor_name_for_vf(&self, pf: &str, vf: u32) -> Result<String>;
}

/// Introspection backed by a sysfs tree, normally mounted at `/sys`.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pci_device(&self, pci: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci)
    }

    fn class_net(&self) -> PathBuf {
        self.root.join("class/net")
    }

    fn read_attr(&self, netdev: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.class_net().join(netdev).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn dir_entries(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn is_uplink_port_name(name: &str) -> bool {
    name.strip_prefix('p')
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Matches a representor `phys_port_name` against PF number and VF index.
///
/// Accepts `pfXvfY` and the legacy bare `Y` form.
pub fn port_name_matches(port_name: &str, pf_num: u32, vf: u32) -> bool {
    if let Some(rest) = port_name.strip_prefix("pf") {
        return match rest.split_once("vf") {
            Some((pf, v)) => pf.parse::<u32>().ok() == Some(pf_num) && v.parse::<u32>().ok() == Some(vf),
            None => false,
        };
    }
    port_name.parse::<u32>().ok() == Some(vf)
}

impl DeviceIntrospection for Sysfs {
    fn uplink_name_for_vf(&self, pci: &str) -> Result<String> {
        let dir = self.pci_device(pci).join("physfn/net");
        let names = dir_entries(&dir).map_err(|e| Error::introspection(pci, e))?;

        // in switchdev mode the PF carries the uplink representor next to other netdevs
        let pf = match names.len() {
            0 => None,
            1 => names.first().cloned(),
            _ => names
                .iter()
                .find(|n| {
                    self.read_attr(n, "phys_port_name")
                        .map(|p| is_uplink_port_name(&p))
                        .unwrap_or(false)
                })
                .or_else(|| names.first())
                .cloned(),
        };
        pf.ok_or_else(|| Error::introspection(pci, format!("no PF netdevice in {}", dir.display())))
    }

    fn vf_index(&self, pci: &str, pf: &str) -> Result<u32> {
        let device = self.class_net().join(pf).join("device");
        let entries = dir_entries(&device).map_err(|e| Error::introspection(pf, e))?;
        for entry in entries {
            let Some(id) = entry.strip_prefix("virtfn").and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(target) = fs::read_link(device.join(&entry)) else {
                continue;
            };
            if target.file_name().map(|n| n == pci).unwrap_or(false) {
                return Ok(id);
            }
        }
        Err(Error::introspection(
            pci,
            format!("unable to get VF ID with PF {}", pf),
        ))
    }

    fn vf_netdev_name(&self, pci: &str) -> Result<String> {
        let dir = self.pci_device(pci).join("net");
        let names = dir_entries(&dir).map_err(|e| Error::introspection(pci, e))?;
        names.into_iter().next().ok_or_else(|| {
            Error::introspection(pci, format!("sysfs path {} has no entries", dir.display()))
        })
    }

    fn has_userspace_driver(&self, pci: &str) -> Result<bool> {
        let driver = self.pci_device(pci).join("driver");
        let target = match fs::read_link(&driver) {
            Ok(target) => target,
            // unbound device
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::introspection(pci, e)),
        };
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(pci, driver = %name, "VF driver");
        Ok(USERSPACE_DRIVERS.contains(&name.as_str()))
    }

    fn representor_name_for_vf(&self, pf: &str, vf: u32) -> Result<String> {
        let switch_id = self
            .read_attr(pf, "phys_switch_id")
            .ok_or_else(|| Error::introspection(pf, "PF is not in switchdev mode"))?;
        let pf_num = self
            .read_attr(pf, "phys_port_name")
            .and_then(|p| p.strip_prefix('p').and_then(|n| n.parse::<u32>().ok()))
            .unwrap_or(0);

        let netdevs = dir_entries(&self.class_net()).map_err(|e| Error::introspection(pf, e))?;
        netdevs
            .into_iter()
            .filter(|n| n != pf)
            .find(|n| {
                self.read_attr(n, "phys_switch_id").as_deref() == Some(switch_id.as_str())
                    && self
                        .read_attr(n, "phys_port_name")
                        .map(|p| port_name_matches(&p, pf_num, vf))
                        .unwrap_or(false)
            })
            .ok_or_else(|| {
                Error::introspection(pf, format!("failed to find representor for VF {}", vf))
            })
    }
}
