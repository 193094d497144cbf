use std::fmt;
use std::net::Ipv4Addr;

use hickory_proto::rr::RecordType;

use crate::classifier::{Blacklist, HomeRanges};
use crate::message::{DecodedMessage, Section};

/// 对单个上游响应的处理结论。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Relay to the client now.
    Pass,
    /// Suppress.
    Filter,
    /// Hold in the delay queue awaiting a better answer.
    Delay,
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Admission::Pass => "pass",
            Admission::Filter => "filter",
            Admission::Delay => "delay",
        })
    }
}

/// Where an upstream sits relative to the home ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamClass {
    Domestic,
    Foreign,
    /// Split mode is off (no home ranges, or a single upstream).
    Unclassified,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    pub bidirectional: bool,
    pub compression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub admission: Admission,
    /// A-record addresses examined before the decision, for logging.
    pub addresses: Vec<Ipv4Addr>,
}

impl Verdict {
    fn new(admission: Admission, addresses: Vec<Ipv4Addr>) -> Self {
        Self {
            admission,
            addresses,
        }
    }
}

pub struct AdmissionEngine {
    blacklist: Blacklist,
    home: HomeRanges,
    policy: Policy,
    split: bool,
}

impl AdmissionEngine {
    /// `upstreams` is the number of configured upstream servers; splitting
    /// into domestic/foreign only happens with home ranges and more than one.
    pub fn new(blacklist: Blacklist, home: HomeRanges, policy: Policy, upstreams: usize) -> Self {
        let split = !home.is_empty() && upstreams > 1;
        Self {
            blacklist,
            home,
            policy,
            split,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn classify_upstream(&self, upstream: Ipv4Addr) -> UpstreamClass {
        if !self.split {
            UpstreamClass::Unclassified
        } else if self.home.contains(upstream) {
            UpstreamClass::Domestic
        } else {
            UpstreamClass::Foreign
        }
    }

    /// Decide what to do with a response that has a live translation entry.
    pub fn evaluate(&self, msg: &DecodedMessage<'_>, upstream: Ipv4Addr) -> Verdict {
        let class = self.classify_upstream(upstream);
        let answers = msg.count(Section::Answer);
        let mut addresses = Vec::new();

        if answers == 0 {
            let admission = match (self.policy.compression, class) {
                // only the foreign upstream is trusted to say "nothing here"
                (true, UpstreamClass::Domestic) => Admission::Filter,
                (true, _) => Admission::Pass,
                (false, _) => Admission::Delay,
            };
            return Verdict::new(admission, addresses);
        }

        for record in msg.records(Section::Answer) {
            let Ok(record) = record else {
                return Verdict::new(Admission::Pass, addresses);
            };
            match record.record_type() {
                RecordType::A => {
                    let Some(ip) = record.ipv4() else {
                        return Verdict::new(Admission::Pass, addresses);
                    };
                    addresses.push(ip);
                    if self.is_poisoned(ip, class) {
                        return Verdict::new(Admission::Filter, addresses);
                    }
                }
                RecordType::AAAA | RecordType::PTR => {
                    return Verdict::new(Admission::Pass, addresses);
                }
                _ => {}
            }
        }

        if answers == 1 && !self.policy.compression {
            return Verdict::new(Admission::Delay, addresses);
        }
        Verdict::new(Admission::Pass, addresses)
    }

    fn is_poisoned(&self, ip: Ipv4Addr, class: UpstreamClass) -> bool {
        if !self.policy.compression && self.blacklist.contains(ip) {
            return true;
        }
        if self.home.contains(ip) {
            class == UpstreamClass::Foreign && self.policy.bidirectional
        } else {
            class == UpstreamClass::Domestic
        }
    }
}
