//! Peer Address Allocation
//!
//! Pure functions over textual address-range specifications. A
//! specification is a list of entries separated by comma or newline,
//! each entry a single IPv4 address or an inclusive `start - end` run.
//! Allocation is deterministic: free addresses are handed out lowest
//! first, so repeated attempts against the same used-set reproduce the
//! same assignment.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

fn parse_addr(token: &str) -> Result<Ipv4Addr> {
    token
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::RangeFormat(token.to_string()))
}

/// Expand a range specification into the full, sorted set of addresses
/// it covers. A `start - end` entry covers every address in the
/// inclusive run, including the network and broadcast addresses of the
/// blocks it summarizes into. Overlapping entries collapse naturally
/// into one set.
pub fn expand_range(spec: &str) -> Result<BTreeSet<Ipv4Addr>> {
    let mut addresses = BTreeSet::new();
    if spec.trim().is_empty() {
        return Ok(addresses);
    }

    for entry in spec.split(|c| c == ',' || c == '\n') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = entry.split('-').map(str::trim).collect();
        match tokens.as_slice() {
            [single] => {
                addresses.insert(parse_addr(single)?);
            }
            [start, end] => {
                let start = u32::from(parse_addr(start)?);
                let end = u32::from(parse_addr(end)?);
                if start > end {
                    return Err(Error::RangeFormat(entry.to_string()));
                }
                for ip in start..=end {
                    addresses.insert(Ipv4Addr::from(ip));
                }
            }
            _ => return Err(Error::RangeFormat(entry.to_string())),
        }
    }

    Ok(addresses)
}

/// Recompute the minimal run-length representation of a specification.
///
/// Returns `Some(replacement)` only when every covered address is
/// private-use, re-expanding the replacement yields exactly the
/// original address set, and the replacement is strictly shorter than
/// the original text. Otherwise the caller keeps the original spec.
pub fn canonicalize(spec: &str) -> Result<Option<String>> {
    let addresses = expand_range(spec)?;
    if addresses.is_empty() {
        return Ok(None);
    }

    for ip in &addresses {
        if !ip.is_private() {
            return Err(Error::NonPrivateAddress(*ip));
        }
    }

    let mut runs: Vec<(Ipv4Addr, Ipv4Addr)> = Vec::new();
    for ip in &addresses {
        match runs.last_mut() {
            Some((_, end)) if u32::from(*end) + 1 == u32::from(*ip) => *end = *ip,
            _ => runs.push((*ip, *ip)),
        }
    }

    let canonical = runs
        .iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{} - {}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    // Round-trip safety: never hand back a spec that covers a
    // different address set than the input did.
    if expand_range(&canonical)? != addresses {
        return Ok(None);
    }

    if canonical.len() < spec.len() {
        Ok(Some(canonical))
    } else {
        Ok(None)
    }
}

/// List the addresses of a range specification that are not in `used`,
/// ascending. Callers take the first element to assign the next
/// available address.
pub fn free_addresses(spec: &str, used: &BTreeSet<Ipv4Addr>) -> Result<Vec<Ipv4Addr>> {
    let addresses = expand_range(spec)?;
    Ok(addresses.difference(used).copied().collect())
}
