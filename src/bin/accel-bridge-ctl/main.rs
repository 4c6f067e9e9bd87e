use accelerated_bridge_cni::cache::{FsStateCache, StateCache};
use accelerated_bridge_cni::config::{
    parse_trunk_list, resolve_trunk, IpamConf, NetConf, PluginSettings, DEFAULT_BRIDGE,
};
use accelerated_bridge_cni::netlink::{IpRoute2, LinkProvider};
use accelerated_bridge_cni::uplink;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Operator tool for the accelerated bridge CNI
#[derive(Parser)]
#[command(name = "accel-bridge-ctl", author, version, about)]
struct Cli {
    /// Directory holding cached attachment records
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "accelerated-bridge-network")]
        name: String,

        /// Comma separated candidate bridges
        #[arg(long, default_value = DEFAULT_BRIDGE)]
        bridge: String,

        /// Port VLAN (0 for none)
        #[arg(long, default_value_t = 0)]
        vlan: u16,

        /// Trunk VLANs, e.g. "10,20-30"
        #[arg(long)]
        trunk: Option<String>,

        /// MTU for the VF and its representor
        #[arg(long)]
        mtu: Option<u32>,

        /// Also program the VLANs on the bridge uplink
        #[arg(long)]
        set_uplink_vlan: bool,

        /// IPAM plugin type
        #[arg(long)]
        ipam_type: Option<String>,

        /// IPAM subnet (CIDR notation)
        #[arg(long, requires = "ipam_type")]
        subnet: Option<String>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Inspect cached attachment records
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show the uplink of a PF and which bridge ports use each uplink VLAN
    Uplink {
        /// PF netdevice name
        #[arg(long)]
        pf: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List record refs
    List,
    /// Print one record
    Show {
        /// Record ref, `<network>-<containerID>-<ifname>`
        state_ref: String,
    },
}

#[allow(clippy::too_many_arguments)]
fn generate_network_config(
    name: &str,
    bridge: &str,
    vlan: u16,
    trunk: Option<&str>,
    mtu: Option<u32>,
    set_uplink_vlan: bool,
    ipam_type: Option<&str>,
    subnet: Option<&str>,
) -> Result<NetConf> {
    if vlan > 4094 {
        bail!("vlan id {} invalid: value must be in the range 0-4094", vlan);
    }
    let trunk = match trunk {
        Some(spec) => parse_trunk_list(spec)?,
        None => Vec::new(),
    };
    // reject what the plugin would reject
    resolve_trunk(&trunk)?;

    let ipam = ipam_type.map(|ipam_type| {
        let mut rest = serde_json::Map::new();
        if let Some(subnet) = subnet {
            rest.insert("subnet".to_string(), subnet.into());
        }
        IpamConf {
            ipam_type: ipam_type.to_string(),
            rest,
        }
    });

    Ok(NetConf {
        cni_version: "1.0.0".to_string(),
        name: name.to_string(),
        plugin_type: "accelerated-bridge".to_string(),
        bridge: bridge.to_string(),
        vlan: vlan.into(),
        trunk,
        mtu,
        set_uplink_vlan,
        ipam,
        ..Default::default()
    })
}

fn show_uplink(pf_name: &str) -> Result<()> {
    let nlink = IpRoute2::new();
    let pf = nlink
        .link_by_name(pf_name)
        .with_context(|| format!("PF {} not found", pf_name))?;
    let uplink = uplink::resolve_uplink(&nlink, &pf)?;
    let bridge = uplink::resolve_parent_bridge(&nlink, &pf)?;

    let links = nlink.link_list()?;
    let membership = nlink.bridge_vlan_list()?;
    let members = uplink::bridge_members(&links, &bridge, &uplink);
    let users = uplink::vlan_users(&members, &membership);

    println!("PF:     {}", pf.name);
    println!("Uplink: {}", uplink.name);
    println!("Bridge: {}", bridge.name);

    let uplink_vids = membership
        .get(&uplink.index)
        .into_iter()
        .flatten()
        .map(|v| v.vid)
        .sorted()
        .dedup()
        .collect::<Vec<_>>();
    println!("Uplink VLANs:");
    for vid in uplink_vids {
        match users.get(&vid) {
            Some(ports) => println!("  {:>4}  {}", vid, ports.join(", ")),
            None => println!("  {:>4}  (unused)", vid),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .init();

    let settings = PluginSettings::from_env();
    let cache = FsStateCache::new(cli.cache_dir.unwrap_or(settings.cache_dir));

    match cli.command {
        Commands::Generate {
            name,
            bridge,
            vlan,
            trunk,
            mtu,
            set_uplink_vlan,
            ipam_type,
            subnet,
            output,
        } => {
            let config = generate_network_config(
                &name,
                &bridge,
                vlan,
                trunk.as_deref(),
                mtu,
                set_uplink_vlan,
                ipam_type.as_deref(),
                subnet.as_deref(),
            )?;
            let config_json = serde_json::to_string_pretty(&config)?;

            if let Some(path) = output {
                fs::write(&path, config_json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }

        Commands::Cache { action } => match action {
            CacheAction::List => {
                for state_ref in cache.list()? {
                    println!("{}", state_ref);
                }
            }
            CacheAction::Show { state_ref } => {
                let conf = cache.load(&state_ref)?;
                println!("{}", serde_json::to_string_pretty(&conf)?);
            }
        },

        Commands::Uplink { pf } => show_uplink(&pf)?,
    }

    Ok(())
}
