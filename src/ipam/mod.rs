//! Delegation to the IPAM plugin named in the netconf.

use anyhow::{anyhow, bail, Context, Result};
use ipnetwork::IpNetwork;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::netlink::IpRoute2;
use crate::types::Result as CniResult;

pub trait Ipam {
    /// Runs ADD on the IPAM plugin `plugin`, feeding it the raw netconf.
    fn exec_add(&self, plugin: &str, netconf: &[u8]) -> Result<CniResult>;
    fn exec_del(&self, plugin: &str, netconf: &[u8]) -> Result<()>;
    /// Applies `result` to `ifname` in the current network namespace.
    fn configure_iface(&self, ifname: &str, result: &CniResult) -> Result<()>;
}

/// Executes IPAM binaries found on `CNI_PATH`.
#[derive(Debug, Clone, Default)]
pub struct ExecIpam {
    ip: IpRoute2,
}

impl ExecIpam {
    pub fn new() -> Self {
        Self { ip: IpRoute2::new() }
    }

    fn find_plugin(&self, plugin: &str) -> Result<PathBuf> {
        let paths = env::var("CNI_PATH").context("CNI_PATH not found in environment")?;
        env::split_paths(&paths)
            .map(|dir| dir.join(plugin))
            .find(|p| p.is_file())
            .ok_or_else(|| anyhow!("failed to find plugin {:?} in path {}", plugin, paths))
    }

    fn exec(&self, plugin: &str, command: &str, netconf: &[u8]) -> Result<Vec<u8>> {
        let path = self.find_plugin(plugin)?;
        debug!(plugin = %path.display(), command, "invoking IPAM plugin");

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute IPAM plugin {}", path.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(netconf)
                .context("Failed to pass netconf to IPAM plugin")?;
        }
        let output = child
            .wait_with_output()
            .context("Failed to wait for IPAM plugin")?;

        if !output.status.success() {
            // plugins report errors as a CNI error object on stdout
            let msg = serde_json::from_slice::<serde_json::Value>(&output.stdout)
                .ok()
                .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            bail!("IPAM plugin {} {} failed: {}", plugin, command, msg);
        }
        Ok(output.stdout)
    }
}

impl Ipam for ExecIpam {
    fn exec_add(&self, plugin: &str, netconf: &[u8]) -> Result<CniResult> {
        let out = self.exec(plugin, "ADD", netconf)?;
        serde_json::from_slice(&out).context("Failed to parse IPAM result")
    }

    fn exec_del(&self, plugin: &str, netconf: &[u8]) -> Result<()> {
        self.exec(plugin, "DEL", netconf).map(|_| ())
    }

    fn configure_iface(&self, ifname: &str, result: &CniResult) -> Result<()> {
        let ips = result.ips.as_deref().unwrap_or_default();
        let mut addresses = Vec::with_capacity(ips.len());
        for ip in ips {
            let net: IpNetwork = ip
                .address
                .parse()
                .with_context(|| format!("Invalid IPAM address {}", ip.address))?;
            self.ip
                .addr_add(ifname, &net.to_string())
                .with_context(|| format!("Failed to add address {} to {}", net, ifname))?;
            addresses.push((net, ip.gateway.as_deref()));
        }

        self.ip
            .link_set_up(ifname)
            .with_context(|| format!("Failed to set {} up", ifname))?;

        for route in result.routes.as_deref().unwrap_or_default() {
            let dst: IpNetwork = route
                .dst
                .parse()
                .with_context(|| format!("Invalid route destination {}", route.dst))?;
            // fall back to the gateway of an address of the same family
            let gw = route.gw.as_deref().or_else(|| {
                addresses
                    .iter()
                    .find(|(net, _)| net.is_ipv4() == dst.is_ipv4())
                    .and_then(|(_, gw)| *gw)
            });
            self.ip
                .route_add(&dst.to_string(), gw, ifname)
                .with_context(|| format!("Failed to add route {} on {}", dst, ifname))?;
        }
        Ok(())
    }
}
