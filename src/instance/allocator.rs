use serde::Serialize;

use crate::error::{FleetError, Result};

/// True when a pair based at `candidate` would touch a pair based at `used`.
/// Pairs `[c, c+1]` and `[u, u+1]` intersect iff `|c - u| <= 1`.
fn overlaps(candidate: u16, used: u16) -> bool {
    candidate.abs_diff(used) <= 1
}

/// Smallest pair base `>= range[0]`, stepping by 2, whose pair is disjoint from
/// every pair already held. Both ports of the returned pair lie within `range`.
pub fn next_port_pair(used: &[u16], range: [u16; 2]) -> Result<u16> {
    let [low, high] = range;
    let mut port = low;
    while port < high {
        if !used.iter().any(|&u| overlaps(port, u)) {
            return Ok(port);
        }
        port = match port.checked_add(2) {
            Some(p) => p,
            None => break,
        };
    }
    Err(FleetError::Conflict(format!(
        "no free port pair in range {}..={}",
        low, high
    )))
}

#[derive(Debug, Clone, Serialize)]
pub struct PortOverview {
    pub base_port: u16,
    pub used: Vec<u16>,
    pub next_available: Vec<u16>,
}

/// Used pair bases plus the next `count` pair bases that `next_port_pair`
/// would hand out in order.
pub fn port_overview(used: &[u16], range: [u16; 2], count: usize) -> PortOverview {
    let mut taken: Vec<u16> = used.to_vec();
    taken.sort_unstable();

    let mut reserved = taken.clone();
    let mut next_available = Vec::with_capacity(count);
    while next_available.len() < count {
        match next_port_pair(&reserved, range) {
            Ok(port) => {
                next_available.push(port);
                reserved.push(port);
            }
            Err(_) => break,
        }
    }

    PortOverview {
        base_port: range[0],
        used: taken,
        next_available,
    }
}
