//! CIDR ranges for `ip_in_range` conditions and scope filters.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation. A bare address is a /32 or /128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange(IpNet);

impl IpRange {
    /// Parses `"10.0.0.0/8"`, `"2001:db8::/32"` or a single address.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.contains('/') {
            input.parse::<IpNet>().ok().map(Self)
        } else {
            input.parse::<IpAddr>().ok().map(|addr| Self(IpNet::from(addr)))
        }
    }

    /// Returns true if `ip` falls inside this range. IPv4-mapped IPv6
    /// addresses are matched as IPv4.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(&normalize(*ip))
    }

    /// Parses `ip` and tests containment; unparseable input is not contained.
    pub fn contains_str(&self, ip: &str) -> bool {
        ip.trim()
            .parse::<IpAddr>()
            .map(|addr| self.contains(&addr))
            .unwrap_or(false)
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpRange::parse(s).ok_or_else(|| format!("invalid CIDR range '{}'", s))
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns true if `ip` is inside any of `ranges`. Invalid ranges are skipped.
pub fn ip_in_any(ip: &str, ranges: &[String]) -> bool {
    let addr = match ip.trim().parse::<IpAddr>() {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    ranges
        .iter()
        .filter_map(|r| IpRange::parse(r))
        .any(|range| range.contains(&addr))
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
