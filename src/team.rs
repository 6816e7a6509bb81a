//! Team identity resolution from peer addresses.
//!
//! Teams reach the game network through the VPN, which assigns each team
//! its own /24 inside a set of /16 prefixes: vulnboxes live in
//! `10.32.<team>.0/24` and players in `10.33.<team>.0/24`. The third octet
//! is the team's net number.

use std::collections::HashMap;
use std::net::IpAddr;

/// Team net number
pub type TeamId = u16;

/// Maps connection source addresses to submitting teams.
#[derive(Debug, Clone)]
pub struct TeamResolver {
    /// First two octets of each team network
    networks: Vec<[u8; 2]>,
    /// Lowest valid net number
    min_net_number: TeamId,
    /// Highest valid net number (unbounded if None)
    max_net_number: Option<TeamId>,
    /// Explicit address assignments, checked before the networks
    hosts: HashMap<IpAddr, TeamId>,
}

impl TeamResolver {
    pub fn new(
        networks: Vec<[u8; 2]>,
        min_net_number: TeamId,
        max_net_number: Option<TeamId>,
    ) -> Self {
        Self {
            networks,
            min_net_number,
            max_net_number,
            hosts: HashMap::new(),
        }
    }

    /// Assign a single address to a team.
    pub fn with_host(mut self, addr: IpAddr, team: TeamId) -> Self {
        self.hosts.insert(addr, team);
        self
    }

    /// Resolve the team a peer address belongs to.
    pub fn resolve(&self, addr: IpAddr) -> Option<TeamId> {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            v4 => v4,
        };

        if let Some(team) = self.hosts.get(&addr) {
            return Some(*team);
        }

        let IpAddr::V4(v4) = addr else {
            return None;
        };
        let octets = v4.octets();

        if !self
            .networks
            .iter()
            .any(|prefix| prefix[..] == octets[..2])
        {
            return None;
        }

        let team = TeamId::from(octets[2]);
        let in_range = team >= self.min_net_number
            && self.max_net_number.map_or(true, |max| team <= max);

        in_range.then_some(team)
    }
}

/// Parse a two-octet network prefix such as `10.32`.
pub fn parse_network(prefix: &str) -> Option<[u8; 2]> {
    let (first, second) = prefix.trim().split_once('.')?;
    Some([first.parse().ok()?, second.parse().ok()?])
}
