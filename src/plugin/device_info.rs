use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

const VERSION_KEY: &str = "version";
const PCI_KEY: &str = "pci";
const REPRESENTOR_KEY: &str = "representor-device";

// representor-device needs at least 1.1.0; other versions are preserved
const UNSUPPORTED_VERSION: &str = "1.0.0";
const MINIMAL_VERSION: &str = "1.1.0";

/// Records `representor` in the device-info file at `path`.
pub fn update_device_info(path: &Path, representor: &str) -> Result<()> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read device info {}", path.display()))?;
    let mut info: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse device info {}", path.display()))?;
    let obj = info
        .as_object_mut()
        .ok_or_else(|| anyhow!("device info is not a JSON object"))?;

    let version = match obj.get(VERSION_KEY) {
        Some(Value::String(v)) => v.clone(),
        Some(_) => bail!("unexpected version field format in device info"),
        None => bail!("no version field in device info"),
    };
    if version == UNSUPPORTED_VERSION {
        debug!(from = %version, to = MINIMAL_VERSION, "upgrading device info version");
        obj.insert(VERSION_KEY.to_string(), Value::from(MINIMAL_VERSION));
    }

    let pci = obj
        .get_mut(PCI_KEY)
        .ok_or_else(|| anyhow!("pci field not found in device info"))?
        .as_object_mut()
        .ok_or_else(|| anyhow!("unexpected pci info format in device info"))?;
    if pci.get(REPRESENTOR_KEY).and_then(Value::as_str) == Some(representor) {
        debug!("representor-device already set");
        return Ok(());
    }
    pci.insert(REPRESENTOR_KEY.to_string(), Value::from(representor));

    let out = serde_json::to_vec(&info).context("Failed to serialize device info")?;
    // the file is kept read-only, lift that just for the rewrite
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to make {} writable", path.display()))?;
    fs::write(path, out)
        .with_context(|| format!("Failed to write device info {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))
        .with_context(|| format!("Failed to restore permissions of {}", path.display()))?;
    Ok(())
}
