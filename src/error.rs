use std::path::PathBuf;

use crate::netlink::NetlinkError;

/// Result type used by the VF/representor core.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a trunk specification was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VlanRangeError {
    /// 0 and 4095 are reserved and can't be set on a Linux bridge.
    #[error("incorrect trunk {field} parameter {value}: value must be in the range 1-4094")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("minID {min} is greater than maxID {max} in trunk parameter")]
    Inverted { min: i64, max: i64 },
    #[error("trunk range needs both minID and maxID")]
    IncompleteRange,
}

/// Errors produced by the VF/representor core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid VLAN range: {0}")]
    InvalidVlanRange(#[from] VlanRangeError),

    #[error("trunk parameter is misconfigured: no VLAN ids resolved")]
    EmptyTrunkSpec,

    #[error("link {link} has no parent bridge: {reason}")]
    NoParentBridge { link: String, reason: String },

    #[error("link {link} is not part of a bond")]
    NoParentBond { link: String },

    #[error("failed to find vf {vf} on {pf}")]
    VfNotFound { pf: String, vf: u32 },

    #[error("failed to {op} {link}: {source}")]
    Link {
        op: &'static str,
        link: String,
        #[source]
        source: NetlinkError,
    },

    #[error("failed to inspect device {device}: {reason}")]
    Introspection { device: String, reason: String },

    #[error("failed to {op} lock {}: {source}", path.display())]
    Lock {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network namespace {path}: {reason}")]
    Netns { path: String, reason: String },

    #[error("failed to parse MAC address {0}")]
    InvalidMac(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns a closure wrapping a [`NetlinkError`] with the failing operation and link.
    pub(crate) fn link(op: &'static str, link: &str) -> impl FnOnce(NetlinkError) -> Error {
        let link = link.to_string();
        move |source| Error::Link { op, link, source }
    }

    pub(crate) fn introspection(device: &str, reason: impl ToString) -> Error {
        Error::Introspection {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}
