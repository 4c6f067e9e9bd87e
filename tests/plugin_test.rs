mod common;

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use accelerated_bridge_cni::error::{Error, Result as CoreResult};
use accelerated_bridge_cni::fake::{FakeIpam, MemStateCache, INIT_NS};
use accelerated_bridge_cni::netlink::LinkProvider;
use accelerated_bridge_cni::netns::NetNs;
use accelerated_bridge_cni::plugin::{update_device_info, Rollback};
use accelerated_bridge_cni::types::{CmdArgs, IPConfig, MacAddr, PluginConf, Result as CniResult};
use accelerated_bridge_cni::{Manager, Plugin};
use common::*;
use tempfile::TempDir;

/// Manager that only records which operations ran.
#[derive(Default)]
struct RecordingManager {
    calls: Mutex<Vec<&'static str>>,
    fail: Option<&'static str>,
}

impl RecordingManager {
    fn failing(op: &'static str) -> Self {
        Self {
            fail: Some(op),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str) -> CoreResult<()> {
        self.calls.lock().unwrap().push(op);
        if self.fail == Some(op) {
            return Err(Error::Config(format!("{} failed", op)));
        }
        Ok(())
    }
}

impl Manager for RecordingManager {
    fn attach_representor(&self, conf: &mut PluginConf) -> CoreResult<()> {
        conf.representor = REP0.to_string();
        self.record("attach_representor")
    }

    fn detach_representor(&self, _conf: &PluginConf) -> CoreResult<()> {
        self.record("detach_representor")
    }

    fn apply_vf_config(&self, _conf: &mut PluginConf) -> CoreResult<()> {
        self.record("apply_vf_config")
    }

    fn reset_vf_config(&self, _conf: &PluginConf) -> CoreResult<()> {
        self.record("reset_vf_config")
    }

    fn setup_vf(
        &self,
        _conf: &mut PluginConf,
        _podif: &str,
        _cid: &str,
        _netns: &dyn NetNs,
    ) -> CoreResult<String> {
        self.record("setup_vf")?;
        Ok("0a:00:00:00:00:01".to_string())
    }

    fn release_vf(
        &self,
        _conf: &PluginConf,
        _podif: &str,
        _cid: &str,
        _netns: &dyn NetNs,
    ) -> CoreResult<()> {
        self.record("release_vf")
    }
}

struct Fixture {
    host: Host,
    cache: Arc<MemStateCache>,
    ipam: Arc<FakeIpam>,
    plugin: Plugin,
}

impl Fixture {
    fn new(ipam: FakeIpam) -> Self {
        let host = Host::new();
        let manager = Arc::new(host.manager());
        Self::with_manager(host, manager, ipam)
    }

    fn with_manager(host: Host, manager: Arc<dyn Manager>, ipam: FakeIpam) -> Self {
        let cache = Arc::new(MemStateCache::new());
        let ipam = Arc::new(ipam);
        let plugin = Plugin::new(
            manager,
            Arc::new(host.config()),
            cache.clone(),
            ipam.clone(),
            Arc::new(host.nlink.namespaces()),
            Arc::new(host.nlink.clone()),
        );
        Self {
            host,
            cache,
            ipam,
            plugin,
        }
    }
}

fn ipam_result() -> CniResult {
    let mut result = CniResult::new("1.0.0");
    result.add_ip(IPConfig {
        interface: None,
        address: "10.10.0.5/16".to_string(),
        gateway: Some("10.10.0.1".to_string()),
    });
    result
}

const STATE_REF: &str = "accel-net-c0ffee-net1";

#[test]
fn test_add_then_del_restores_host() -> Result<(), Box<dyn std::error::Error>> {
    let f = Fixture::new(FakeIpam::default());
    let netconf = netconf(
        r#""vlan":100,"setUplinkVlan":true,"mtu":2000,"mac":"0a:00:00:00:00:01","trust":"on""#,
    );
    let args = cmd_args(&netconf);

    let result = f.plugin.cmd_add(&args)?;

    let iface = &result.interfaces.as_ref().ok_or("no interfaces")?[0];
    assert_eq!(iface.name, "net1");
    assert_eq!(iface.mac.as_deref(), Some("0a:00:00:00:00:01"));
    assert_eq!(iface.sandbox.as_deref(), Some(POD_NETNS));
    assert_eq!(f.host.nlink.ns_of("net1"), Some(f.host.pod_ns));
    assert_eq!(f.host.link(REP0).master_index, Some(BRIDGE_INDEX));
    assert_eq!(f.host.nlink.vids(BOND_INDEX), vec![100]);
    let saved = f.cache.get(STATE_REF).ok_or("no cached record")?;
    assert_eq!(saved.representor, REP0);
    assert_eq!(saved.cont_if_name, "net1");

    f.plugin.cmd_check(&args)?;
    f.plugin.cmd_del(&args)?;

    let vf = f.host.link(VF0_NETDEV);
    assert_eq!(vf.mtu, 1500);
    assert_eq!(vf.hardware_addr, Some(MacAddr::from(VF0_MAC)));
    let pf = f.host.link(PF);
    let vf_info = pf.vf(0).ok_or("VF 0 missing")?;
    assert_eq!(vf_info.mac, Some(MacAddr::from(VF0_ADMIN_MAC)));
    assert!(!vf_info.trust);
    let rep = f.host.link(REP0);
    assert_eq!(rep.master_index, None);
    assert_eq!(rep.mtu, 1500);
    assert!(f.host.nlink.vids(BOND_INDEX).is_empty());
    assert!(f.cache.is_empty());
    Ok(())
}

#[test]
fn test_del_twice_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let f = Fixture::new(FakeIpam::default());
    let netconf = netconf(r#""vlan":100"#);
    let args = cmd_args(&netconf);

    f.plugin.cmd_add(&args)?;
    f.plugin.cmd_del(&args)?;
    f.host.nlink.clear_journal();

    f.plugin.cmd_del(&args)?;
    assert!(f.host.nlink.journal().is_empty());
    Ok(())
}

#[test]
fn test_del_without_netns() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::default());
    let f = Fixture::with_manager(Host::new(), manager.clone(), FakeIpam::default());
    let netconf = netconf("");
    let mut args = cmd_args(&netconf);

    f.plugin.cmd_add(&args)?;
    args.netns = String::new();
    f.plugin.cmd_del(&args)?;

    assert_eq!(
        manager.calls(),
        vec!["attach_representor", "apply_vf_config", "setup_vf"]
    );
    assert_eq!(f.cache.len(), 1);
    Ok(())
}

#[test]
fn test_del_after_netns_is_gone() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::default());
    let ipam = FakeIpam::new(ipam_result());
    let f = Fixture::with_manager(Host::new(), manager.clone(), ipam);
    let netconf = netconf(r#""ipam":{"type":"host-local"}"#);
    let mut args = cmd_args(&netconf);

    f.plugin.cmd_add(&args)?;
    args.netns = "/var/run/netns/gone".to_string();
    f.plugin.cmd_del(&args)?;

    // nothing to release from a namespace that no longer exists
    assert_eq!(
        manager.calls(),
        vec![
            "attach_representor",
            "apply_vf_config",
            "setup_vf",
            "detach_representor"
        ]
    );
    assert_eq!(
        f.ipam.calls(),
        vec!["add host-local", "configure net1", "del host-local"]
    );
    assert!(f.cache.is_empty());
    Ok(())
}

#[test]
fn test_setup_failure_detaches_once() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::failing("setup_vf"));
    let f = Fixture::with_manager(Host::new(), manager.clone(), FakeIpam::default());
    let netconf = netconf(r#""vlan":100"#);

    assert!(f.plugin.cmd_add(&cmd_args(&netconf)).is_err());

    // the VF never reached the pod, so only the representor is undone
    assert_eq!(
        manager.calls(),
        vec![
            "attach_representor",
            "apply_vf_config",
            "setup_vf",
            "detach_representor"
        ]
    );
    assert!(f.cache.is_empty());
    Ok(())
}

#[test]
fn test_attach_failure_has_nothing_to_undo() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::failing("attach_representor"));
    let f = Fixture::with_manager(Host::new(), manager.clone(), FakeIpam::default());
    let netconf = netconf("");

    let err = f
        .plugin
        .cmd_add(&cmd_args(&netconf))
        .err()
        .ok_or("ADD succeeded")?;
    assert!(format!("{:#}", err).contains("attach representor"));
    assert_eq!(manager.calls(), vec!["attach_representor"]);
    Ok(())
}

#[test]
fn test_ipam_failure_unwinds_everything() -> Result<(), Box<dyn std::error::Error>> {
    let f = Fixture::new(FakeIpam::new(ipam_result()).failing_add());
    let netconf = netconf(r#""vlan":100,"mtu":2000,"ipam":{"type":"host-local"}"#);

    assert!(f.plugin.cmd_add(&cmd_args(&netconf)).is_err());

    assert_eq!(f.ipam.calls(), vec!["add host-local"]);
    let vf = f
        .host
        .nlink
        .link_in(INIT_NS, VF0_NETDEV)
        .ok_or("VF not returned to the host")?;
    assert_eq!(vf.mtu, 1500);
    assert!(f.host.nlink.link_in(f.host.pod_ns, "net1").is_none());
    let rep = f.host.link(REP0);
    assert_eq!(rep.master_index, None);
    assert_eq!(rep.mtu, 1500);
    assert!(f.cache.is_empty());
    Ok(())
}

#[test]
fn test_ipam_without_addresses_is_released() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::default());
    let ipam = FakeIpam::new(CniResult::new("1.0.0"));
    let f = Fixture::with_manager(Host::new(), manager.clone(), ipam);
    let netconf = netconf(r#""ipam":{"type":"host-local"}"#);

    assert!(f.plugin.cmd_add(&cmd_args(&netconf)).is_err());

    assert_eq!(f.ipam.calls(), vec!["add host-local", "del host-local"]);
    assert_eq!(manager.calls().last(), Some(&"detach_representor"));
    Ok(())
}

#[test]
fn test_ipam_result_is_returned() -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(RecordingManager::default());
    let f = Fixture::with_manager(Host::new(), manager, FakeIpam::new(ipam_result()));
    let netconf = netconf(r#""ipam":{"type":"host-local","subnet":"10.10.0.0/16"}"#);

    let result = f.plugin.cmd_add(&cmd_args(&netconf))?;

    assert_eq!(result.cni_version, "1.0.0");
    let ips = result.ips.as_ref().ok_or("no ips")?;
    assert_eq!(ips[0].address, "10.10.0.5/16");
    assert_eq!(ips[0].interface, Some(0));
    let iface = &result.interfaces.as_ref().ok_or("no interfaces")?[0];
    assert_eq!(iface.name, "net1");
    assert_eq!(iface.mac.as_deref(), Some("0a:00:00:00:00:01"));
    assert_eq!(f.ipam.calls(), vec!["add host-local", "configure net1"]);
    Ok(())
}

#[test]
fn test_check_detects_detached_representor() -> Result<(), Box<dyn std::error::Error>> {
    let f = Fixture::new(FakeIpam::default());
    let netconf = netconf("");
    let args = cmd_args(&netconf);

    f.plugin.cmd_add(&args)?;
    f.plugin.cmd_check(&args)?;

    let mut rep = f.host.link(REP0);
    f.host.nlink.set_no_master(&mut rep)?;
    assert!(f.plugin.cmd_check(&args).is_err());
    Ok(())
}

#[test]
fn test_add_annotates_device_info() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("devinfo.json");
    fs::write(
        &path,
        r#"{"type":"pci","version":"1.0.0","pci":{"pci-address":"0000:03:00.2"}}"#,
    )?;
    let f = Fixture::new(FakeIpam::default());
    let netconf = netconf(&format!(
        r#""runtimeConfig":{{"CNIDeviceInfoFile":"{}"}}"#,
        path.display()
    ));

    f.plugin.cmd_add(&cmd_args(&netconf))?;

    let info: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
    assert_eq!(info["version"], "1.1.0");
    assert_eq!(info["pci"]["representor-device"], REP0);
    assert_eq!(info["pci"]["pci-address"], "0000:03:00.2");
    assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o444);
    Ok(())
}

#[test]
fn test_device_info_failure_is_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let f = Fixture::new(FakeIpam::default());
    let netconf = netconf(r#""runtimeConfig":{"CNIDeviceInfoFile":"/nonexistent/devinfo.json"}"#);

    f.plugin.cmd_add(&cmd_args(&netconf))?;
    assert_eq!(f.cache.len(), 1);
    Ok(())
}

#[test]
fn test_device_info_rules() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("devinfo.json");

    // newer versions are kept
    fs::write(&path, r#"{"version":"1.2.0","pci":{}}"#)?;
    update_device_info(&path, "pf0vf3")?;
    let info: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
    assert_eq!(info["version"], "1.2.0");
    assert_eq!(info["pci"]["representor-device"], "pf0vf3");

    // already annotated, left as is
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    update_device_info(&path, "pf0vf3")?;
    assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);

    fs::write(&path, r#"{"version":1,"pci":{}}"#)?;
    assert!(update_device_info(&path, "pf0vf3").is_err());
    fs::write(&path, r#"{"pci":{}}"#)?;
    assert!(update_device_info(&path, "pf0vf3").is_err());
    fs::write(&path, r#"{"version":"1.0.0","pci":"0000:03:00.2"}"#)?;
    assert!(update_device_info(&path, "pf0vf3").is_err());
    fs::write(&path, r#"{"version":"1.0.0"}"#)?;
    assert!(update_device_info(&path, "pf0vf3").is_err());
    Ok(())
}

#[test]
fn test_rollback_runs_in_reverse() {
    let ran = Rc::new(RefCell::new(Vec::new()));
    let mut rollback = Rollback::new();
    for name in ["detach representor", "release VF", "release IPAM"] {
        let ran = ran.clone();
        rollback.register(name, move || {
            ran.borrow_mut().push(name);
            if name == "release VF" {
                anyhow::bail!("{} failed", name);
            }
            Ok(())
        });
    }
    assert_eq!(
        rollback.pending(),
        vec!["detach representor", "release VF", "release IPAM"]
    );

    rollback.unwind();

    // a failing action does not stop the earlier ones
    assert_eq!(
        *ran.borrow(),
        vec!["release IPAM", "release VF", "detach representor"]
    );
}

#[test]
fn test_rollback_commit_runs_nothing() {
    let ran = Rc::new(RefCell::new(0));
    let mut rollback = Rollback::new();
    let counter = ran.clone();
    rollback.register("detach representor", move || {
        *counter.borrow_mut() += 1;
        Ok(())
    });
    assert_eq!(rollback.len(), 1);

    rollback.commit();
    assert_eq!(*ran.borrow(), 0);
    assert!(Rollback::new().is_empty());
}

#[test]
fn test_missing_netns_fails_add() {
    let manager = Arc::new(RecordingManager::default());
    let f = Fixture::with_manager(Host::new(), manager.clone(), FakeIpam::default());
    let netconf = netconf("");
    let args = CmdArgs {
        netns: "/var/run/netns/unknown".to_string(),
        ..cmd_args(&netconf)
    };

    assert!(f.plugin.cmd_add(&args).is_err());
    assert!(manager.calls().is_empty());
}
