mod common;

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;

use accelerated_bridge_cni::config::{Config, ConfigLoader, NetConf, PluginSettings, Toggle};
use accelerated_bridge_cni::error::{Error, VlanRangeError};
use accelerated_bridge_cni::fake::{FakeIntrospection, FakeNetlink};
use accelerated_bridge_cni::netlink::{Link, LinkKind, VfLinkState};
use accelerated_bridge_cni::sriov::{port_name_matches, DeviceIntrospection, Sysfs};
use accelerated_bridge_cni::types::MacAddr;
use common::*;
use tempfile::TempDir;

#[test]
fn test_netconf_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::parse(br#"{"cniVersion":"1.0.0","name":"accel-net","type":"accelerated-bridge"}"#)?;

    assert_eq!(conf.bridge, "cni0");
    assert_eq!(conf.vlan, 0);
    assert!(conf.trunk.is_empty());
    assert!(!conf.set_uplink_vlan);
    assert!(conf.ipam.is_none());
    assert_eq!(conf.bridges()?, vec!["cni0".to_string()]);
    Ok(())
}

#[test]
fn test_netconf_full() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::parse(
        br#"{
            "cniVersion": "1.0.0",
            "name": "accel-net",
            "type": "accelerated-bridge",
            "bridge": "br1, br2",
            "deviceID": "0000:03:00.2",
            "vlan": 100,
            "trunk": [{"minID": 200, "maxID": 210}],
            "mtu": 9000,
            "setUplinkVlan": true,
            "spoofchk": "off",
            "trust": "on",
            "link_state": "enable",
            "max_tx_rate": 1000,
            "debug": true,
            "ipam": {"type": "host-local", "subnet": "10.10.0.0/16"},
            "runtimeConfig": {"mac": "0a:00:00:00:00:01", "CNIDeviceInfoFile": "/var/run/k8s.cni.cncf.io/devinfo/x.json"}
        }"#,
    )?;

    assert_eq!(conf.bridges()?, vec!["br1".to_string(), "br2".to_string()]);
    assert_eq!(conf.mtu, Some(9000));
    assert_eq!(conf.spoofchk, Some(Toggle::Off));
    assert_eq!(conf.trust, Some(Toggle::On));
    assert_eq!(conf.link_state, Some(VfLinkState::Enable));
    assert_eq!(conf.max_tx_rate, Some(1000));
    assert_eq!(conf.min_tx_rate, None);
    let ipam = conf.ipam.as_ref().ok_or("ipam missing")?;
    assert_eq!(ipam.ipam_type, "host-local");
    assert_eq!(ipam.rest["subnet"], "10.10.0.0/16");
    assert!(conf.runtime_config.device_info_file.is_some());

    // the netconf survives the cache round trip unchanged
    let again = NetConf::parse(&serde_json::to_vec(&conf)?)?;
    assert_eq!(again, conf);
    Ok(())
}

#[test]
fn test_netconf_rejects_bad_values() {
    assert!(matches!(NetConf::parse(b"not json"), Err(Error::Config(_))));
    assert!(matches!(
        NetConf::parse(br#"{"spoofchk":"maybe"}"#),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        NetConf::parse(br#"{"link_state":"up"}"#),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_parse_conf_resolves_device() -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::new();
    let conf = host.conf(&netconf(r#""vlan":100,"trunk":[{"id":20},{"id":10}]"#))?;

    assert_eq!(conf.pf_name, PF);
    assert_eq!(conf.vf_id, 0);
    assert_eq!(conf.orig_vf_state.host_if_name, VF0_NETDEV);
    assert!(!conf.is_userspace_driver);
    assert_eq!(conf.vlan, 100);
    assert_eq!(conf.trunk, vec![10, 20]);
    assert_eq!(conf.actual_bridge, BRIDGE);
    assert_eq!(conf.mac, None);
    Ok(())
}

#[test]
fn test_parse_conf_requires_device_id() {
    let host = Host::new();
    let conf = r#"{"cniVersion":"1.0.0","name":"accel-net","type":"accelerated-bridge"}"#;

    let result = host
        .config()
        .parse_conf(conf.as_bytes(), &cmd_args(conf));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_parse_conf_vlan_range() {
    let host = Host::new();
    for vlan in [-1, 4095] {
        let result = host.conf(&netconf(&format!(r#""vlan":{}"#, vlan)));
        assert!(result.is_err(), "vlan {} accepted", vlan);
    }
    assert!(host.conf(&netconf(r#""vlan":4094"#)).is_ok());
}

#[test]
fn test_parse_conf_invalid_trunk() {
    let host = Host::new();
    let netconf = netconf(r#""trunk":[{"minID":1000,"maxID":50}]"#);

    let result = host
        .config()
        .parse_conf(netconf.as_bytes(), &cmd_args(&netconf));
    assert!(matches!(
        result,
        Err(Error::InvalidVlanRange(VlanRangeError::Inverted { .. }))
    ));
}

#[test]
fn test_userspace_vf_has_no_netdev() -> Result<(), Box<dyn std::error::Error>> {
    let nlink = FakeNetlink::new();
    let sriov = FakeIntrospection::new().with_userspace_vf(VF0_PCI, PF, 3, "pf0vf3");
    let config = Config::new(Arc::new(sriov), Arc::new(nlink));

    let netconf = netconf("");
    let conf = config.parse_conf(netconf.as_bytes(), &cmd_args(&netconf))?;
    assert!(conf.is_userspace_driver);
    assert_eq!(conf.vf_id, 3);
    assert!(conf.orig_vf_state.host_if_name.is_empty());
    Ok(())
}

#[test]
fn test_mac_precedence() -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::new();
    let config = host.config();
    let top = "0a:00:00:00:00:01";
    let arg = "0a:00:00:00:00:02";
    let runtime = "0a:00:00:00:00:03";

    let only_top = netconf(&format!(r#""mac":"{}""#, top));
    let mut args = cmd_args(&only_top);
    assert_eq!(config.parse_conf(only_top.as_bytes(), &args)?.mac, Some(top.parse::<MacAddr>()?));

    args.args.insert("MAC".to_string(), arg.to_string());
    assert_eq!(config.parse_conf(only_top.as_bytes(), &args)?.mac, Some(arg.parse::<MacAddr>()?));

    let with_runtime = netconf(&format!(
        r#""mac":"{}","runtimeConfig":{{"mac":"{}"}}"#,
        top, runtime
    ));
    assert_eq!(
        config.parse_conf(with_runtime.as_bytes(), &args)?.mac,
        Some(runtime.parse::<MacAddr>()?)
    );

    let bad = netconf(r#""mac":"not-a-mac""#);
    assert!(matches!(
        config.parse_conf(bad.as_bytes(), &cmd_args(&bad)),
        Err(Error::InvalidMac(_))
    ));
    Ok(())
}

#[test]
fn test_empty_mac_is_unset() -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::new();
    let config = host.config();
    let arg = "0a:00:00:00:00:09";

    let empty_top = netconf(r#""mac":"""#);
    assert_eq!(config.parse_conf(empty_top.as_bytes(), &cmd_args(&empty_top))?.mac, None);

    // an empty runtime MAC falls through to CNI_ARGS
    let empty_runtime = netconf(r#""mac":"","runtimeConfig":{"mac":" "}"#);
    let mut args = cmd_args(&empty_runtime);
    args.args.insert("MAC".to_string(), arg.to_string());
    assert_eq!(
        config.parse_conf(empty_runtime.as_bytes(), &args)?.mac,
        Some(arg.parse::<MacAddr>()?)
    );
    Ok(())
}

#[test]
fn test_single_bridge_skips_detection() -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::new();
    // the PF can't even be looked up, a single candidate is taken as is
    host.nlink.fail("link_by_name", PF);

    let conf = host.conf(&netconf_on("br-other", ""))?;
    assert_eq!(conf.actual_bridge, "br-other");
    Ok(())
}

#[test]
fn test_bridge_detected_from_candidates() -> Result<(), Box<dyn std::error::Error>> {
    let host = Host::new();
    let conf = host.conf(&netconf_on("br-other, br0", ""))?;
    assert_eq!(conf.actual_bridge, BRIDGE);

    // directly enslaved PF, no bond in between
    let nlink = FakeNetlink::new();
    nlink.add_link(Link::new(1, "bridge1").with_kind(LinkKind::Bridge));
    nlink.add_link(Link::new(2, "bridge2").with_kind(LinkKind::Bridge));
    nlink.add_link(Link::new(3, PF).with_master(2));
    let sriov = FakeIntrospection::new().with_vf(VF0_PCI, PF, 0, VF0_NETDEV, REP0);
    let config = Config::new(Arc::new(sriov), Arc::new(nlink));
    let netconf = netconf_on("bridge1, bridge2", "");
    let conf = config.parse_conf(netconf.as_bytes(), &cmd_args(&netconf))?;
    assert_eq!(conf.actual_bridge, "bridge2");
    Ok(())
}

#[test]
fn test_detected_bridge_not_in_candidates() {
    let host = Host::new();
    let result = host.conf(&netconf_on("br1,br2", ""));
    assert!(result.is_err());

    let netconf = netconf_on("br1,br2", "");
    assert!(matches!(
        host.config().parse_conf(netconf.as_bytes(), &cmd_args(&netconf)),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_empty_bridge_entry() {
    let host = Host::new();
    let netconf = netconf_on("br0,,br1", "");
    assert!(matches!(
        host.config().parse_conf(netconf.as_bytes(), &cmd_args(&netconf)),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_plugin_settings_default() {
    let settings = PluginSettings::default();
    assert_eq!(settings.cache_dir, Path::new("/var/lib/cni/accelerated-bridge"));
    assert_eq!(
        settings.lock_file,
        Path::new("/var/run/accelerated-bridge-cni/uplink-vlan.lock")
    );
    assert_eq!(settings.sysfs_root, Path::new("/sys"));
}

fn write_attr(root: &Path, netdev: &str, attr: &str, value: &str) -> std::io::Result<()> {
    let dir = root.join("class/net").join(netdev);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(attr), format!("{}\n", value))
}

/// A sysfs tree with one switchdev PF, one kernel-driver VF and one vfio VF.
fn sysfs_tree() -> Result<TempDir, Box<dyn std::error::Error>> {
    let root = TempDir::new()?;
    let r = root.path();
    let devices = r.join("bus/pci/devices");

    for (pci, driver) in [(VF0_PCI, "mlx5_core"), (VF1_PCI, "vfio-pci")] {
        let dev = devices.join(pci);
        fs::create_dir_all(dev.join("physfn/net").join(PF))?;
        symlink(format!("../../../bus/pci/drivers/{}", driver), dev.join("driver"))?;
    }
    fs::create_dir_all(devices.join(VF0_PCI).join("net").join(VF0_NETDEV))?;

    let pf_device = r.join("class/net").join(PF).join("device");
    fs::create_dir_all(&pf_device)?;
    symlink(format!("../{}", VF0_PCI), pf_device.join("virtfn0"))?;
    symlink(format!("../{}", VF1_PCI), pf_device.join("virtfn1"))?;

    write_attr(r, PF, "phys_switch_id", "a1b2c3")?;
    write_attr(r, PF, "phys_port_name", "p0")?;
    write_attr(r, REP0, "phys_switch_id", "a1b2c3")?;
    write_attr(r, REP0, "phys_port_name", "pf0vf0")?;
    write_attr(r, REP1, "phys_switch_id", "a1b2c3")?;
    write_attr(r, REP1, "phys_port_name", "pf0vf1")?;
    // same port name on another switch
    write_attr(r, "eth9", "phys_switch_id", "ffffff")?;
    write_attr(r, "eth9", "phys_port_name", "pf0vf0")?;
    Ok(root)
}

#[test]
fn test_sysfs_introspection() -> Result<(), Box<dyn std::error::Error>> {
    let root = sysfs_tree()?;
    let sysfs = Sysfs::new(root.path());

    assert_eq!(sysfs.uplink_name_for_vf(VF0_PCI)?, PF);
    assert_eq!(sysfs.vf_index(VF0_PCI, PF)?, 0);
    assert_eq!(sysfs.vf_index(VF1_PCI, PF)?, 1);
    assert_eq!(sysfs.vf_netdev_name(VF0_PCI)?, VF0_NETDEV);
    assert!(!sysfs.has_userspace_driver(VF0_PCI)?);
    assert!(sysfs.has_userspace_driver(VF1_PCI)?);
    assert!(sysfs.vf_netdev_name(VF1_PCI).is_err());
    assert_eq!(sysfs.representor_name_for_vf(PF, 0)?, REP0);
    assert_eq!(sysfs.representor_name_for_vf(PF, 1)?, REP1);
    assert!(sysfs.representor_name_for_vf(PF, 5).is_err());
    Ok(())
}

#[test]
fn test_sysfs_unknown_device() -> Result<(), Box<dyn std::error::Error>> {
    let root = sysfs_tree()?;
    let sysfs = Sysfs::new(root.path());

    assert!(matches!(
        sysfs.uplink_name_for_vf("0000:99:00.0"),
        Err(Error::Introspection { .. })
    ));
    assert!(sysfs.vf_index("0000:99:00.0", PF).is_err());
    // unbound device
    assert!(!sysfs.has_userspace_driver("0000:99:00.0")?);
    Ok(())
}

#[test]
fn test_sysfs_requires_switchdev() -> Result<(), Box<dyn std::error::Error>> {
    let root = TempDir::new()?;
    fs::create_dir_all(root.path().join("class/net/eth0"))?;
    let sysfs = Sysfs::new(root.path());

    assert!(sysfs.representor_name_for_vf("eth0", 0).is_err());
    Ok(())
}

#[test]
fn test_representor_port_names() {
    assert!(port_name_matches("pf0vf3", 0, 3));
    assert!(port_name_matches("pf1vf12", 1, 12));
    assert!(!port_name_matches("pf1vf3", 0, 3));
    assert!(!port_name_matches("pf0vf3", 0, 4));
    assert!(port_name_matches("3", 0, 3));
    assert!(!port_name_matches("p0", 0, 0));
    assert!(!port_name_matches("pf0", 0, 0));
}
