use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionEngine};
use crate::config::RuntimeConfig;
use crate::delay::{DELAY_CAPACITY, DelayQueue};
use crate::error::{Error, Result};
use crate::message::decode;
use crate::proto_utils::{compression_variant, rewrite_id};
use crate::translate::{TRANSLATION_CAPACITY, TranslationTable};

const BUF_SIZE: usize = 4096;
/// 事件循环的最长等待时间，同时驱动延迟队列 / Upper bound on one loop iteration; also drives the delay queue
const TICK: Duration = Duration::from_millis(50);

enum Event {
    Local(std::io::Result<()>),
    Remote(std::io::Result<()>),
    Tick,
}

/// Single-threaded forwarder: owns both sockets and every table, so nothing
/// needs a lock.
pub struct Forwarder {
    local: UdpSocket,
    remote: UdpSocket,
    upstreams: Vec<SocketAddr>,
    domestic: usize,
    translations: TranslationTable,
    delays: DelayQueue,
    admission: AdmissionEngine,
}

impl Forwarder {
    pub fn bind(cfg: RuntimeConfig) -> anyhow::Result<Self> {
        let local = create_udp_socket(cfg.listen)
            .with_context(|| format!("bind listen socket {}", cfg.listen))?;
        let remote = create_udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .context("bind upstream socket")?;
        Ok(Self::new(local, remote, cfg))
    }

    pub fn new(local: UdpSocket, remote: UdpSocket, cfg: RuntimeConfig) -> Self {
        let admission = AdmissionEngine::new(cfg.blacklist, cfg.home, cfg.policy, cfg.upstreams.len());
        Self {
            local,
            remote,
            domestic: cfg.domestic.min(cfg.upstreams.len()),
            upstreams: cfg.upstreams,
            translations: TranslationTable::new(TRANSLATION_CAPACITY),
            delays: DelayQueue::new(DELAY_CAPACITY, cfg.delay),
            admission,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.local.local_addr()
    }

    /// Run until a socket becomes unusable. Per-packet failures are logged
    /// and never end the loop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            listen = %self.local_addr()?,
            upstreams = self.upstreams.len(),
            domestic = self.domestic,
            delay_ms = self.delays.threshold().as_millis() as u64,
            "dns forwarder started"
        );

        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; BUF_SIZE];

        loop {
            let event = tokio::select! {
                ready = self.local.readable() => Event::Local(ready),
                ready = self.remote.readable() => Event::Remote(ready),
                _ = ticker.tick() => Event::Tick,
            };
            match event {
                Event::Local(ready) => {
                    ready.context("listen socket error")?;
                    self.drain_local(&mut buf);
                }
                Event::Remote(ready) => {
                    ready.context("upstream socket error")?;
                    self.drain_remote(&mut buf);
                }
                Event::Tick => {}
            }
            self.flush_delayed(Instant::now());
        }
    }

    fn drain_local(&mut self, buf: &mut [u8]) {
        loop {
            match self.local.try_recv_from(buf) {
                Ok((len, client)) => {
                    if let Err(err) = self.handle_query(&mut buf[..len], client, Instant::now()) {
                        log_packet_error(&err, client, "query");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(error = %err, "recv from client failed");
                    return;
                }
            }
        }
    }

    fn drain_remote(&mut self, buf: &mut [u8]) {
        loop {
            match self.remote.try_recv_from(buf) {
                Ok((len, upstream)) => {
                    if let Err(err) = self.handle_response(&mut buf[..len], upstream, Instant::now()) {
                        log_packet_error(&err, upstream, "response");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    // e.g. ICMP port unreachable surfacing from an earlier send
                    warn!(error = %err, "recv from upstream failed");
                    return;
                }
            }
        }
    }

    /// 客户端查询：分配新 ID 并转发给所有上游 / Client query: translate the ID and fan out to every upstream
    fn handle_query(&mut self, packet: &mut [u8], client: SocketAddr, now: Instant) -> Result<()> {
        let msg = decode(packet)?;
        let (original_id, qname) = (msg.id(), msg.question_name());
        debug!(event = "dns_request", qname = qname.as_deref().unwrap_or("-"), client = %client, "request");

        let new_id = self
            .translations
            .allocate(original_id, client, now.into_std());
        rewrite_id(packet, new_id).ok_or(Error::Truncated)?;

        let variant = if self.admission.policy().compression {
            compression_variant(packet)
        } else {
            None
        };
        match variant {
            Some(mutated) => {
                for upstream in &self.upstreams[..self.domestic] {
                    self.send_upstream(packet, *upstream);
                }
                for upstream in &self.upstreams[self.domestic..] {
                    self.send_upstream(&mutated, *upstream);
                }
            }
            None => {
                for upstream in &self.upstreams {
                    self.send_upstream(packet, *upstream);
                }
            }
        }
        Ok(())
    }

    /// 上游响应：还原客户端 ID，判定放行、延迟或过滤
    fn handle_response(&mut self, packet: &mut [u8], upstream: SocketAddr, now: Instant) -> Result<Admission> {
        let msg = decode(packet)?;
        let query_id = msg.id();
        let (original_id, client, created_at) = self
            .translations
            .lookup(query_id)
            .map(|entry| (entry.original_id, entry.client, entry.created_at))
            .ok_or(Error::UnknownQuery(query_id))?;
        let verdict = self.admission.evaluate(&msg, upstream_ipv4(upstream));
        let qname = msg.question_name();

        rewrite_id(packet, original_id).ok_or(Error::Truncated)?;

        match verdict.admission {
            Admission::Pass => self.send_client(packet, client),
            Admission::Delay => {
                let payload = Bytes::copy_from_slice(packet);
                if let Some(evicted) = self.delays.schedule(query_id, payload, client, now.into_std()) {
                    debug!(query_id = evicted.query_id, "delay queue full, dropped oldest entry");
                }
            }
            Admission::Filter => {}
        }
        debug!(
            event = "dns_response",
            qname = qname.as_deref().unwrap_or("-"),
            upstream = %upstream,
            answers = ?verdict.addresses,
            decision = %verdict.admission,
            elapsed_ms = now.into_std().saturating_duration_since(created_at).as_millis() as u64,
            "response"
        );
        Ok(verdict.admission)
    }

    fn flush_delayed(&mut self, now: Instant) {
        for entry in self.delays.tick(now.into_std()) {
            debug!(query_id = entry.query_id, client = %entry.target, "flush delayed response");
            self.send_client(&entry.payload, entry.target);
        }
    }

    fn send_upstream(&self, packet: &[u8], upstream: SocketAddr) {
        if let Err(err) = self.remote.try_send_to(packet, upstream) {
            warn!(upstream = %upstream, error = %Error::Transport(err), "send to upstream failed");
        }
    }

    fn send_client(&self, packet: &[u8], client: SocketAddr) {
        if let Err(err) = self.local.try_send_to(packet, client) {
            warn!(client = %client, error = %Error::Transport(err), "send to client failed");
        }
    }
}

fn log_packet_error(err: &Error, peer: SocketAddr, kind: &str) {
    match err {
        Error::UnknownQuery(id) => debug!(peer = %peer, id, kind, "skip"),
        Error::Truncated => error!(peer = %peer, kind, error = %err, "malformed message"),
        _ => warn!(peer = %peer, kind, error = %err, "packet dropped"),
    }
}

fn upstream_ipv4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}
