use std::collections::BTreeSet;

use super::Trunk;
use crate::error::{Error, Result, VlanRangeError};

const VLAN_MIN: i64 = 1;
const VLAN_MAX: i64 = 4094;

/// Expands trunk specs into a sorted, duplicate-free list of VLAN ids.
///
/// An empty spec list resolves to an empty set; a non-empty one that yields
/// nothing is rejected.
pub fn resolve_trunk(trunks: &[Trunk]) -> Result<Vec<u16>> {
    if trunks.is_empty() {
        return Ok(Vec::new());
    }

    let mut vlans = BTreeSet::new();
    for trunk in trunks {
        match (trunk.min_id, trunk.max_id) {
            (Some(min), Some(max)) => {
                let min = checked("minID", min)?;
                let max = checked("maxID", max)?;
                if min > max {
                    return Err(VlanRangeError::Inverted {
                        min: min.into(),
                        max: max.into(),
                    }
                    .into());
                }
                vlans.extend(min..=max);
            }
            (None, None) => {}
            (min, max) => {
                // still report a bad bound before the missing one
                if let Some(min) = min {
                    checked("minID", min)?;
                }
                if let Some(max) = max {
                    checked("maxID", max)?;
                }
                return Err(VlanRangeError::IncompleteRange.into());
            }
        }
        if let Some(id) = trunk.id {
            vlans.insert(checked("id", id)?);
        }
    }

    if vlans.is_empty() {
        return Err(Error::EmptyTrunkSpec);
    }
    Ok(vlans.into_iter().collect())
}

// 0 and 4095 are reserved and can't be set on a Linux bridge
fn checked(field: &'static str, value: i64) -> std::result::Result<u16, VlanRangeError> {
    if (VLAN_MIN..=VLAN_MAX).contains(&value) {
        Ok(value as u16)
    } else {
        Err(VlanRangeError::OutOfRange { field, value })
    }
}

/// Parses the compact trunk syntax used on the command line, e.g. `10,20-30`.
pub fn parse_trunk_list(spec: &str) -> Result<Vec<Trunk>> {
    spec.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('-') {
            Some((min, max)) => Ok(Trunk {
                id: None,
                min_id: Some(parse_id(min)?),
                max_id: Some(parse_id(max)?),
            }),
            None => Ok(Trunk {
                id: Some(parse_id(item)?),
                min_id: None,
                max_id: None,
            }),
        })
        .collect()
}

fn parse_id(s: &str) -> Result<i64> {
    s.trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid VLAN id {:?} in trunk list", s.trim())))
}
