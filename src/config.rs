use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::admission::Policy;
use crate::classifier::{Blacklist, HomeRanges, parse_blacklist, parse_home_ranges};
use crate::delay::DEFAULT_DELAY;
use crate::error::Error;

pub const DEFAULT_SERVERS: &str =
    "114.114.114.114,223.5.5.5,8.8.8.8,8.8.4.4,208.67.222.222:443,208.67.222.222:5353";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 监听地址，缺省 0.0.0.0。
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口，缺省 53。
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// 上游 DNS 列表，`host[:port]`，端口缺省 53。
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    /// IP 黑名单文件（每行一个 IPv4 地址）。
    #[serde(default)]
    pub iplist: Option<PathBuf>,
    /// 国内网段文件（每行 `address[/prefix]`）。
    #[serde(default)]
    pub chnroute: Option<PathBuf>,
    /// 可疑响应的延迟时间（秒），缺省 0.3。
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    /// 双向过滤：国外上游返回国内 IP 时同样过滤。
    #[serde(default)]
    pub bidirectional: bool,
    /// 为发往国外上游的查询插入压缩指针。
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            servers: default_servers(),
            iplist: None,
            chnroute: None,
            delay_secs: default_delay_secs(),
            bidirectional: false,
            compression: false,
            verbose: false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(target = "config", path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Split a comma-separated server list as accepted on the command line.
pub fn split_servers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything the forwarder needs, resolved and validated.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    /// Domestic upstreams first, then foreign ones.
    pub upstreams: Vec<SocketAddr>,
    /// Length of the domestic prefix of `upstreams`.
    pub domestic: usize,
    pub blacklist: Blacklist,
    pub home: HomeRanges,
    pub policy: Policy,
    pub delay: Duration,
}

impl RuntimeConfig {
    pub async fn build(settings: Settings) -> Result<Self> {
        if settings.compression && settings.chnroute.is_none() {
            return Err(Error::Config("compression requires a chnroute file".into()).into());
        }
        if !settings.delay_secs.is_finite() || settings.delay_secs < 0.0 {
            return Err(Error::Config(format!("invalid delay: {}", settings.delay_secs)).into());
        }
        if settings.servers.is_empty() {
            return Err(Error::Config("no upstream servers".into()).into());
        }

        let listen = resolve_endpoint(&settings.bind_addr, settings.bind_port)
            .await
            .context("resolve listen address")?;

        let blacklist = match &settings.iplist {
            Some(path) => {
                let list = parse_blacklist(&read_list(path)?);
                if list.is_empty() {
                    warn!(target = "config", path = %path.display(), "blacklist file has no entries");
                }
                list
            }
            None => Blacklist::default(),
        };
        let home = match &settings.chnroute {
            Some(path) => parse_home_ranges(&read_list(path)?),
            None => HomeRanges::default(),
        };

        let mut resolved = Vec::with_capacity(settings.servers.len());
        for server in &settings.servers {
            let (host, port) = split_host_port(server)?;
            let addr = resolve_endpoint(host, port)
                .await
                .with_context(|| format!("resolve upstream {server}"))?;
            resolved.push(addr);
        }
        let (upstreams, domestic) = partition_upstreams(resolved, &home);

        if settings.compression && (domestic == 0 || domestic == upstreams.len()) {
            warn!(
                target = "config",
                domestic,
                total = upstreams.len(),
                "compression works best with both domestic and foreign upstreams"
            );
        }

        info!(
            target = "config",
            blacklist = blacklist.len(),
            home_ranges = home.len(),
            upstreams = upstreams.len(),
            domestic,
            "runtime config ready"
        );

        Ok(Self {
            listen,
            upstreams,
            domestic,
            blacklist,
            home,
            policy: Policy {
                bidirectional: settings.bidirectional,
                compression: settings.compression,
            },
            delay: Duration::from_secs_f64(settings.delay_secs),
        })
    }
}

/// Stable partition: upstreams inside the home ranges first.
pub fn partition_upstreams(servers: Vec<SocketAddr>, home: &HomeRanges) -> (Vec<SocketAddr>, usize) {
    if home.is_empty() {
        return (servers, 0);
    }
    let (mut domestic, foreign): (Vec<_>, Vec<_>) = servers
        .into_iter()
        .partition(|addr| matches!(addr.ip(), IpAddr::V4(ip) if home.contains(ip)));
    let count = domestic.len();
    domestic.extend(foreign);
    (domestic, count)
}

/// `host[:port]`; the port defaults to 53.
pub fn split_host_port(server: &str) -> Result<(&str, u16)> {
    let server = server.trim();
    match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in upstream: {server}")))?;
            if host.is_empty() {
                return Err(Error::Config(format!("missing host in upstream: {server}")).into());
            }
            Ok((host, port))
        }
        None if server.is_empty() => Err(Error::Config("empty upstream".into()).into()),
        None => Ok((server, 53)),
    }
}

/// Resolve to the first IPv4 endpoint; the upstream socket is IPv4 only.
async fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::from((ip, port)));
    }
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("lookup {host}"))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::Config(format!("no IPv4 address for {host}")).into())
}

fn read_list(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read list file: {}", path.display()))
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    53
}

fn default_servers() -> Vec<String> {
    split_servers(DEFAULT_SERVERS)
}

fn default_delay_secs() -> f64 {
    DEFAULT_DELAY.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_fields_default_when_omitted() {
        let cfg: Settings = serde_json::from_value(json!({ "bind_port": 5353 })).expect("parse");
        assert_eq!(cfg.bind_port, 5353);
        assert_eq!(cfg.bind_addr, "0.0.0.0");
        assert_eq!(cfg.servers.len(), 6);
        assert_eq!(cfg.delay_secs, 0.3);
        assert!(!cfg.compression && !cfg.bidirectional && !cfg.verbose);
        assert!(cfg.iplist.is_none() && cfg.chnroute.is_none());
    }

    #[test]
    fn split_host_port_defaults_to_53() {
        assert_eq!(split_host_port("8.8.8.8").unwrap(), ("8.8.8.8", 53));
        assert_eq!(split_host_port("208.67.222.222:443").unwrap(), ("208.67.222.222", 443));
        assert_eq!(split_host_port(" dns.example:5353 ").unwrap(), ("dns.example", 5353));
        assert!(split_host_port("8.8.8.8:notaport").is_err());
        assert!(split_host_port(":53").is_err());
        assert!(split_host_port("").is_err());
    }

    #[test]
    fn split_servers_skips_blanks() {
        assert_eq!(split_servers("a, b,,c:54"), vec!["a", "b", "c:54"]);
    }

    #[test]
    fn upstreams_partition_domestic_first() {
        let home = parse_home_ranges("114.114.0.0/16\n223.5.0.0/16\n");
        let servers: Vec<SocketAddr> = ["8.8.8.8:53", "114.114.114.114:53", "208.67.222.222:443", "223.5.5.5:53"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let (ordered, domestic) = partition_upstreams(servers.clone(), &home);
        assert_eq!(domestic, 2);
        assert_eq!(ordered, vec![servers[1], servers[3], servers[0], servers[2]]);

        let (unchanged, none) = partition_upstreams(servers.clone(), &HomeRanges::default());
        assert_eq!(none, 0);
        assert_eq!(unchanged, servers);
    }

    #[tokio::test]
    async fn compression_without_chnroute_is_rejected() {
        let settings = Settings {
            compression: true,
            ..Default::default()
        };
        let err = RuntimeConfig::build(settings).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[tokio::test]
    async fn negative_delay_is_rejected() {
        let settings = Settings {
            delay_secs: -1.0,
            ..Default::default()
        };
        assert!(RuntimeConfig::build(settings).await.is_err());
    }

    #[tokio::test]
    async fn build_loads_lists_and_orders_upstreams() {
        let dir = std::env::temp_dir().join(format!("chinadns-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let iplist = dir.join("iplist.txt");
        let chnroute = dir.join("chnroute.txt");
        fs::write(&iplist, "1.2.3.4\n5.6.7.8\n").unwrap();
        fs::write(&chnroute, "114.114.0.0/16\n").unwrap();

        let settings = Settings {
            bind_addr: "127.0.0.1".into(),
            bind_port: 15353,
            servers: vec!["8.8.8.8".into(), "114.114.114.114:5353".into()],
            iplist: Some(iplist),
            chnroute: Some(chnroute),
            delay_secs: 0.5,
            compression: true,
            ..Default::default()
        };
        let rt = RuntimeConfig::build(settings).await.expect("build");
        fs::remove_dir_all(&dir).ok();

        assert_eq!(rt.listen, "127.0.0.1:15353".parse::<SocketAddr>().unwrap());
        assert_eq!(rt.domestic, 1);
        assert_eq!(rt.upstreams[0], "114.114.114.114:5353".parse::<SocketAddr>().unwrap());
        assert_eq!(rt.blacklist.len(), 2);
        assert_eq!(rt.home.len(), 1);
        assert!(rt.policy.compression);
        assert_eq!(rt.delay, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn missing_list_file_is_fatal() {
        let settings = Settings {
            servers: vec!["8.8.8.8".into()],
            iplist: Some(PathBuf::from("/nonexistent/iplist.txt")),
            ..Default::default()
        };
        assert!(RuntimeConfig::build(settings).await.is_err());
    }
}
