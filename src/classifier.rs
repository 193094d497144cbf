use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::warn;

/// 精确匹配的 IP 黑名单，按主机字节序升序排列。
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    ips: Vec<u32>,
}

impl Blacklist {
    pub fn new(addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut ips: Vec<u32> = addresses.into_iter().map(u32::from).collect();
        ips.sort_unstable();
        Self { ips }
    }

    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ips.binary_search(&u32::from(addr)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

/// A single CIDR block in host byte order; `mask` is the prefix mask
/// (all ones for a /32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEntry {
    pub address: u32,
    pub mask: u32,
}

impl From<Ipv4Net> for NetworkEntry {
    fn from(net: Ipv4Net) -> Self {
        let net = net.trunc();
        Self {
            address: u32::from(net.addr()),
            mask: u32::from(net.netmask()),
        }
    }
}

/// 本地区域（"国内"）网段集合，按起始地址升序排列以便二分查找。
#[derive(Debug, Clone, Default)]
pub struct HomeRanges {
    nets: Vec<NetworkEntry>,
}

impl HomeRanges {
    pub fn new(nets: impl IntoIterator<Item = Ipv4Net>) -> Self {
        let mut nets: Vec<NetworkEntry> = nets.into_iter().map(NetworkEntry::from).collect();
        nets.sort_unstable_by_key(|n| n.address);
        Self { nets }
    }

    /// Only the entry with the largest start address not above `addr` is
    /// tested (the first entry when `addr` precedes them all), so an address
    /// covered solely by an earlier, wider block that a later block starts
    /// inside of is not found.
    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let target = u32::from(addr);
        let idx = self.nets.partition_point(|n| n.address <= target);
        let Some(candidate) = self.nets.get(idx.saturating_sub(1)) else {
            return false;
        };
        (candidate.address ^ target) & candidate.mask == 0
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// One IPv4 literal per line; blank lines and `#` comments are skipped.
pub fn parse_blacklist(text: &str) -> Blacklist {
    let ips = meaningful_lines(text).filter_map(|(lineno, line)| match line.parse::<Ipv4Addr>() {
        Ok(ip) => Some(ip),
        Err(err) => {
            warn!(target = "classifier", line = lineno, value = %line, error = %err, "skip invalid blacklist entry");
            None
        }
    });
    Blacklist::new(ips)
}

/// `address[/prefix]` per line; a bare address is a /32.
pub fn parse_home_ranges(text: &str) -> HomeRanges {
    let nets = meaningful_lines(text).filter_map(|(lineno, line)| match parse_cidr(line) {
        Some(net) => Some(net),
        None => {
            warn!(target = "classifier", line = lineno, value = %line, "skip invalid network entry");
            None
        }
    });
    HomeRanges::new(nets)
}

fn parse_cidr(s: &str) -> Option<Ipv4Net> {
    if s.contains('/') {
        s.parse::<Ipv4Net>().ok()
    } else {
        s.parse::<Ipv4Addr>().ok().map(Ipv4Net::from)
    }
}

fn meaningful_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}
