use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{FsStateCache, StateCache};
use crate::config::{Config, ConfigLoader, PluginSettings};
use crate::ipam::{ExecIpam, Ipam};
use crate::lock::FileLock;
use crate::logging;
use crate::manager::{Manager, VfManager};
use crate::netlink::{IpRoute2, LinkProvider};
use crate::netns::{HostNamespaces, Namespaces, NetNs, NsError};
use crate::sriov::Sysfs;
use crate::types::{CmdArgs, Interface, PluginConf, Result as CniResult};

mod device_info;
mod saga;

pub use device_info::update_device_info;
pub use saga::Rollback;

/// Accelerated bridge plugin: sequences the manager for ADD, DEL and CHECK.
pub struct Plugin {
    manager: Arc<dyn Manager>,
    config: Arc<dyn ConfigLoader>,
    cache: Arc<dyn StateCache>,
    ipam: Arc<dyn Ipam>,
    namespaces: Arc<dyn Namespaces>,
    nlink: Arc<dyn LinkProvider>,
}

impl Plugin {
    pub fn new(
        manager: Arc<dyn Manager>,
        config: Arc<dyn ConfigLoader>,
        cache: Arc<dyn StateCache>,
        ipam: Arc<dyn Ipam>,
        namespaces: Arc<dyn Namespaces>,
        nlink: Arc<dyn LinkProvider>,
    ) -> Self {
        Self {
            manager,
            config,
            cache,
            ipam,
            namespaces,
            nlink,
        }
    }

    /// The plugin wired to the running host.
    pub fn from_settings(settings: &PluginSettings) -> Self {
        let nlink: Arc<dyn LinkProvider> = Arc::new(IpRoute2::new());
        let sriov = Arc::new(Sysfs::new(&settings.sysfs_root));
        let namespaces: Arc<dyn Namespaces> = Arc::new(HostNamespaces);
        let lock = Arc::new(FileLock::new(&settings.lock_file));
        let manager = VfManager::new(nlink.clone(), sriov.clone(), namespaces.clone(), lock);
        Self::new(
            Arc::new(manager),
            Arc::new(Config::new(sriov, nlink.clone())),
            Arc::new(FsStateCache::new(&settings.cache_dir)),
            Arc::new(ExecIpam::new()),
            namespaces,
            nlink,
        )
    }

    /// Attaches the VF to the pod. Everything done is rolled back on failure.
    pub fn cmd_add(&self, args: &CmdArgs) -> Result<CniResult> {
        let mut conf = self
            .config
            .parse_conf(&args.stdin_data, args)
            .context("failed to load netconf")?;
        if conf.net_conf.debug {
            logging::set_debug();
        }

        let netns = self
            .namespaces
            .get_ns(&args.netns)
            .with_context(|| format!("failed to open netns {:?}", args.netns))?;

        let mut result = CniResult::new(&conf.net_conf.cni_version);
        result.add_interface(Interface {
            name: args.ifname.clone(),
            mac: None,
            sandbox: Some(netns.path().to_string()),
        });

        let mut rollback = Rollback::new();
        match self.add_steps(&mut conf, args, netns, &mut result, &mut rollback) {
            Ok(()) => rollback.commit(),
            Err(e) => {
                error!(error = %format!("{:#}", e), "ADD failed");
                rollback.unwind();
                return Err(e);
            }
        }

        if let Some(path) = &conf.net_conf.runtime_config.device_info_file {
            // the attachment works without it
            if let Err(e) = update_device_info(Path::new(path), &conf.representor) {
                error!(error = %format!("{:#}", e), "failed to update device info");
            }
        }

        debug!("ADD done");
        Ok(result)
    }

    fn add_steps(
        &self,
        conf: &mut PluginConf,
        args: &CmdArgs,
        netns: Arc<dyn NetNs>,
        result: &mut CniResult,
        rollback: &mut Rollback,
    ) -> Result<()> {
        self.manager
            .attach_representor(conf)
            .context("failed to attach representor")?;
        let manager = self.manager.clone();
        let attached = conf.clone();
        rollback.register("detach representor", move || {
            manager.detach_representor(&attached)?;
            Ok(())
        });

        self.manager
            .apply_vf_config(conf)
            .context("failed to configure VF")?;

        let mut mac = String::new();
        if !conf.is_userspace_driver {
            let setup = self
                .manager
                .setup_vf(conf, &args.ifname, &args.container_id, netns.as_ref());
            self.register_release(rollback, conf, args, netns.clone());
            mac = setup.with_context(|| {
                format!(
                    "failed to set up pod interface {:?} from the device {:?}",
                    args.ifname, conf.pf_name
                )
            })?;
        }

        let ipam_type = conf
            .net_conf
            .ipam
            .as_ref()
            .map(|i| i.ipam_type.clone())
            .unwrap_or_default();
        if !ipam_type.is_empty() {
            self.configure_ipam(conf, args, &ipam_type, netns.as_ref(), &mac, result, rollback)
                .context("failed to configure IPAM")?;
        } else if !mac.is_empty() {
            if let Some(iface) = result.interfaces.as_mut().and_then(|i| i.first_mut()) {
                iface.mac = Some(mac);
            }
        }

        let state_ref = self
            .cache
            .state_ref(&conf.net_conf.name, &args.container_id, &args.ifname);
        self.cache
            .save(&state_ref, conf)
            .context("failed to save plugin state")?;
        Ok(())
    }

    // the VF is released only if it actually reached the pod namespace
    fn register_release(
        &self,
        rollback: &mut Rollback,
        conf: &PluginConf,
        args: &CmdArgs,
        netns: Arc<dyn NetNs>,
    ) {
        let manager = self.manager.clone();
        let nlink = self.nlink.clone();
        let conf = conf.clone();
        let ifname = args.ifname.clone();
        let cid = args.container_id.clone();
        rollback.register("release VF", move || {
            let mut moved = false;
            netns.run_in(&mut || {
                moved = nlink.link_by_name(&ifname).is_ok();
                Ok(())
            })?;
            if moved {
                manager.release_vf(&conf, &ifname, &cid, netns.as_ref())?;
            } else {
                debug!(ifname = %ifname, "VF never reached the pod namespace");
            }
            Ok(())
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn configure_ipam(
        &self,
        conf: &PluginConf,
        args: &CmdArgs,
        ipam_type: &str,
        netns: &dyn NetNs,
        mac: &str,
        result: &mut CniResult,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let mut ipam_result = self
            .ipam
            .exec_add(ipam_type, &args.stdin_data)
            .with_context(|| {
                format!(
                    "failed to set up IPAM plugin type {:?} from the device {:?}",
                    ipam_type, conf.pf_name
                )
            })?;

        let ipam = self.ipam.clone();
        let plugin = ipam_type.to_string();
        let stdin = args.stdin_data.clone();
        rollback.register("release IPAM", move || ipam.exec_del(&plugin, &stdin));

        if ipam_result.ips.as_ref().map_or(true, Vec::is_empty) {
            bail!("IPAM plugin returned missing IP config");
        }

        // every address belongs to the pod interface
        for ip in ipam_result.ips.iter_mut().flatten() {
            ip.interface = Some(0);
        }
        let mut interfaces = result.interfaces.take().unwrap_or_default();
        if let Some(iface) = interfaces.first_mut() {
            iface.mac = Some(mac.to_string()).filter(|m| !m.is_empty());
        }
        ipam_result.interfaces = Some(interfaces);
        ipam_result.cni_version = result.cni_version.clone();

        if !conf.is_userspace_driver {
            let mut configured = Ok(());
            netns.run_in(&mut || {
                configured = self.ipam.configure_iface(&args.ifname, &ipam_result);
                Ok(())
            })?;
            configured?;
        }

        *result = ipam_result;
        Ok(())
    }

    /// Undoes a previous ADD. Missing state is not an error.
    pub fn cmd_del(&self, args: &CmdArgs) -> Result<()> {
        if args.netns.is_empty() {
            warn!("DEL skipped, netns is not provided");
            return Ok(());
        }

        let netconf = self
            .config
            .load_conf(&args.stdin_data)
            .context("failed to load netconf")?;
        let state_ref = self
            .cache
            .state_ref(&netconf.name, &args.container_id, &args.ifname);

        // without the record there is nothing to undo, and failing would make
        // the runtime retry forever
        let conf = match self.cache.load(&state_ref) {
            Ok(conf) => conf,
            Err(e) => {
                info!(state = %state_ref, error = %format!("{:#}", e), "no cached state, nothing to undo");
                return Ok(());
            }
        };
        if conf.net_conf.debug {
            logging::set_debug();
        }

        match self.del_steps(&conf, args) {
            Ok(()) => {
                if let Err(e) = self.cache.delete(&state_ref) {
                    warn!(state = %state_ref, error = %format!("{:#}", e), "failed to remove cached state");
                }
                debug!("DEL done");
                Ok(())
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "DEL failed");
                Err(e)
            }
        }
    }

    fn del_steps(&self, conf: &PluginConf, args: &CmdArgs) -> Result<()> {
        if let Err(e) = self.manager.detach_representor(conf) {
            warn!(rep = %conf.representor, error = %e, "failed to detach representor");
        }

        let mut ipam_err = None;
        if let Some(ipam) = conf.net_conf.ipam.as_ref().filter(|i| !i.ipam_type.is_empty()) {
            if let Err(e) = self.ipam.exec_del(&ipam.ipam_type, &args.stdin_data) {
                warn!(plugin = %ipam.ipam_type, error = %format!("{:#}", e), "failed to release IPAM");
                ipam_err = Some(e.context("failed to release IPAM"));
            }
        }

        let netns = match self.namespaces.get_ns(&args.netns) {
            Ok(netns) => netns,
            // the pod is gone, e.g. after a node reboot
            Err(NsError::PathNotExist(path)) => {
                info!(netns = %path, "netns no longer exists");
                return ipam_err.map_or(Ok(()), Err);
            }
            Err(e) => return Err(anyhow!(e).context(format!("failed to open netns {:?}", args.netns))),
        };

        if !conf.is_userspace_driver {
            self.manager
                .release_vf(conf, &args.ifname, &args.container_id, netns.as_ref())
                .context("failed to release VF")?;
        }
        self.manager
            .reset_vf_config(conf)
            .context("failed to reset VF config")?;

        ipam_err.map_or(Ok(()), Err)
    }

    /// Verifies the representor recorded by ADD is still on its bridge.
    pub fn cmd_check(&self, args: &CmdArgs) -> Result<()> {
        let netconf = self
            .config
            .load_conf(&args.stdin_data)
            .context("failed to load netconf")?;
        let state_ref = self
            .cache
            .state_ref(&netconf.name, &args.container_id, &args.ifname);
        let conf = self
            .cache
            .load(&state_ref)
            .context("failed to load cached state")?;

        let rep = self
            .nlink
            .link_by_name(&conf.representor)
            .with_context(|| format!("representor {} not found", conf.representor))?;
        let bridge = self
            .nlink
            .link_by_name(&conf.actual_bridge)
            .with_context(|| format!("bridge {} not found", conf.actual_bridge))?;
        if rep.master_index != Some(bridge.index) {
            bail!(
                "representor {} is not attached to bridge {}",
                rep.name,
                bridge.name
            );
        }
        Ok(())
    }
}
