//! UDP broadcast discovery
//!
//! A server runs an [`Advertiser`] that answers probes on the discovery port.
//! A client runs a [`Discoverer`] that probes the broadcast addresses on an
//! interval, records every server that answers in a [`PeerTable`], and
//! surfaces each new one exactly once.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::net;
use crate::protocol::{self, DISCOVERY_PROBE, MAX_DATAGRAM};
use crate::token::CancelToken;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub hostname: String,
    pub os_family: String,
    pub is_windows_like: bool,
    /// Session port the peer accepts connections on
    pub port: u16,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn session_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Reply body sent by an advertiser
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub ip: String,
    pub port: u16,
    pub hostname: String,
    pub os_type: String,
    #[serde(default)]
    pub is_windows: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DiscoveryMessage {
    #[serde(rename = "DISCOVERY_REQUEST")]
    Request,
    #[serde(rename = "SERVER_ADVERTISEMENT")]
    Advertisement(Advertisement),
}

impl DiscoveryMessage {
    /// `None` for anything that is not ours
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let trimmed = datagram.trim_ascii();
        if trimmed == DISCOVERY_PROBE {
            return Some(Self::Request);
        }
        serde_json::from_slice(trimmed).ok()
    }
}

pub enum Observed {
    New(PeerRecord),
    Refreshed,
}

/// Known peers keyed by address
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<IpAddr, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, address: IpAddr, ad: &Advertisement) -> Observed {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        if let Some(rec) = peers.get_mut(&address) {
            rec.last_seen = now;
            rec.hostname.clone_from(&ad.hostname);
            rec.port = ad.port;
            return Observed::Refreshed;
        }
        let rec = PeerRecord {
            address,
            hostname: ad.hostname.clone(),
            os_family: ad.os_type.clone(),
            is_windows_like: ad.is_windows,
            port: ad.port,
            first_seen_at: Utc::now(),
            last_seen: now,
        };
        peers.insert(address, rec.clone());
        Observed::New(rec)
    }

    /// Remove and return peers not seen within `ttl`
    pub fn expire(&self, ttl: Duration) -> Vec<PeerRecord> {
        let mut peers = self.peers.lock();
        let stale: Vec<IpAddr> = peers
            .values()
            .filter(|r| r.last_seen.elapsed() > ttl)
            .map(|r| r.address)
            .collect();
        stale.iter().filter_map(|ip| peers.remove(ip)).collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut v: Vec<PeerRecord> = self.peers.lock().values().cloned().collect();
        v.sort_by_key(|r| r.address);
        v
    }

    pub fn get(&self, address: IpAddr) -> Option<PeerRecord> {
        self.peers.lock().get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers discovery probes for a server
pub struct Advertiser {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Advertiser {
    /// Bind the discovery port and start answering. Bind failure is returned;
    /// the caller decides whether that is fatal.
    pub fn spawn(
        config: &Config,
        hostname: String,
        session_port: u16,
        token: CancelToken,
    ) -> Result<Self> {
        let socket = net::bind_udp(config.bind_ip, config.discovery_port, true, config.poll())
            .with_context(|| format!("bind discovery port {}", config.discovery_port))?;
        let local_addr = socket.local_addr()?;
        let template = Advertisement {
            ip: String::new(),
            port: session_port,
            hostname,
            os_type: protocol::os_family().to_string(),
            is_windows: protocol::is_windows(),
        };
        let fixed_ip = config.advertise_ip;
        info!(addr = %local_addr, "advertising on discovery port");
        let handle = std::thread::Builder::new()
            .name("lanpush-advertise".into())
            .spawn(move || advertise_loop(socket, template, fixed_ip, token))?;
        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn advertise_loop(
    socket: UdpSocket,
    template: Advertisement,
    fixed_ip: Option<IpAddr>,
    token: CancelToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !token.is_cancelled() {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if net::is_timeout(&e) => continue,
            Err(e) => {
                warn!("discovery receive failed: {}", e);
                continue;
            }
        };
        match DiscoveryMessage::parse(&buf[..n]) {
            Some(DiscoveryMessage::Request) => {}
            Some(DiscoveryMessage::Advertisement(_)) => continue,
            None => {
                debug!(from = %from, len = n, "ignoring foreign datagram");
                continue;
            }
        }
        let ip = fixed_ip
            .or_else(|| net::local_ip_towards(from.ip()))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut ad = template.clone();
        ad.ip = ip.to_string();
        let reply = match serde_json::to_vec(&DiscoveryMessage::Advertisement(ad)) {
            Ok(r) => r,
            Err(e) => {
                warn!("cannot encode advertisement: {}", e);
                continue;
            }
        };
        match socket.send_to(&reply, from) {
            Ok(_) => debug!(to = %from, "advertisement sent"),
            Err(e) => debug!(to = %from, "advertisement not sent: {}", e),
        }
    }
    debug!("advertiser stopped");
}

pub type PeerObserver = Box<dyn Fn(&PeerRecord) + Send + 'static>;

/// Probes for servers until cancelled
pub struct Discoverer {
    handle: JoinHandle<()>,
}

impl Discoverer {
    pub fn spawn(
        config: &Config,
        table: Arc<PeerTable>,
        events: EventSink,
        on_new: Option<PeerObserver>,
        token: CancelToken,
    ) -> Result<Self> {
        let probe = Probe::open(config)?;
        let handle = std::thread::Builder::new()
            .name("lanpush-discover".into())
            .spawn(move || {
                probe.run(&table, Some(&events), on_new.as_ref(), &token, None);
                debug!("discoverer stopped");
            })?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

/// Probe for `timeout` and return every server that answered
pub fn discover(config: &Config, timeout: Duration) -> Result<Vec<PeerRecord>> {
    let probe = Probe::open(config)?;
    let table = PeerTable::new();
    let token = CancelToken::new();
    probe.run(&table, None, None, &token, Some(Instant::now() + timeout));
    Ok(table.snapshot())
}

struct Probe {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    own: Vec<IpAddr>,
    allow_loopback: bool,
    interval: Duration,
    ttl: Duration,
}

impl Probe {
    fn open(config: &Config) -> Result<Self> {
        let socket = net::bind_udp(config.bind_ip, 0, true, config.poll())
            .context("bind discovery probe socket")?;

        let mut targets = Vec::new();
        if config.discovery_port != 0 {
            targets.push(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                config.discovery_port,
            ));
            if let Some(bcast) = net::subnet_broadcast() {
                targets.push(SocketAddr::new(IpAddr::V4(bcast), config.discovery_port));
            }
        }
        targets.extend(config.discovery_targets.iter().copied());

        let own: Vec<IpAddr> = [net::primary_ip(), config.advertise_ip]
            .into_iter()
            .flatten()
            .collect();

        Ok(Self {
            socket,
            targets,
            own,
            allow_loopback: config.allow_loopback,
            interval: config.discovery_interval(),
            ttl: config.peer_ttl(),
        })
    }

    fn send_probes(&self) {
        let probe = match serde_json::to_vec(&DiscoveryMessage::Request) {
            Ok(p) => p,
            Err(_) => return,
        };
        for target in &self.targets {
            if let Err(e) = self.socket.send_to(&probe, target) {
                debug!(target = %target, "probe not sent: {}", e);
            }
        }
    }

    fn is_self(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || self.own.contains(&ip)
    }

    fn run(
        &self,
        table: &PeerTable,
        events: Option<&EventSink>,
        on_new: Option<&PeerObserver>,
        token: &CancelToken,
        deadline: Option<Instant>,
    ) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut last_probe: Option<Instant> = None;
        while !token.is_cancelled() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if last_probe.map_or(true, |t| t.elapsed() >= self.interval) {
                self.send_probes();
                last_probe = Some(Instant::now());
                for gone in table.expire(self.ttl) {
                    info!(peer = %gone.address, host = %gone.hostname, "peer expired");
                    if let Some(ev) = events {
                        ev.emit(Event::PeerExpired(gone.address));
                    }
                }
            }

            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if net::is_timeout(&e) => continue,
                Err(e) => {
                    debug!("discovery receive failed: {}", e);
                    continue;
                }
            };
            let ad = match DiscoveryMessage::parse(&buf[..n]) {
                Some(DiscoveryMessage::Advertisement(ad)) => ad,
                Some(DiscoveryMessage::Request) => continue,
                None => {
                    debug!(from = %from, len = n, "ignoring foreign datagram");
                    continue;
                }
            };
            let address = ad
                .ip
                .parse::<IpAddr>()
                .ok()
                .filter(|ip| !ip.is_unspecified())
                .unwrap_or(from.ip());
            if !self.allow_loopback && self.is_self(address) {
                debug!(peer = %address, "ignoring own advertisement");
                continue;
            }
            if let Observed::New(rec) = table.observe(address, &ad) {
                info!(peer = %rec.address, host = %rec.hostname, port = rec.port, "discovered server");
                if let Some(ev) = events {
                    ev.emit(Event::PeerDiscovered(rec.clone()));
                }
                if let Some(cb) = on_new {
                    cb(&rec);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(host: &str, port: u16) -> Advertisement {
        Advertisement {
            ip: "10.0.0.5".into(),
            port,
            hostname: host.into(),
            os_type: "windows".into(),
            is_windows: true,
        }
    }

    #[test]
    fn test_observe_dedups_by_address() {
        let table = PeerTable::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(matches!(table.observe(ip, &ad("SRV1", 5001)), Observed::New(_)));
        assert!(matches!(table.observe(ip, &ad("SRV1", 5001)), Observed::Refreshed));
        assert!(matches!(table.observe(ip, &ad("SRV1", 6001)), Observed::Refreshed));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(ip).unwrap().port, 6001);
        assert!(table.get(ip).unwrap().is_windows_like);
    }

    #[test]
    fn test_expire_removes_stale_peers() {
        let table = PeerTable::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        table.observe(ip, &ad("SRV1", 5001));
        assert!(table.expire(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        let gone = table.expire(Duration::from_millis(5));
        assert_eq!(gone.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_accepts_both_probe_forms() {
        assert_eq!(
            DiscoveryMessage::parse(b"LANPUSH_DISCOVER\n"),
            Some(DiscoveryMessage::Request)
        );
        assert_eq!(
            DiscoveryMessage::parse(br#"{"type":"DISCOVERY_REQUEST"}"#),
            Some(DiscoveryMessage::Request)
        );
        assert_eq!(DiscoveryMessage::parse(b"\x00\x01garbage"), None);
        assert_eq!(DiscoveryMessage::parse(br#"{"type":"OTHER"}"#), None);
    }

    #[test]
    fn test_advertisement_wire_shape() {
        let v = serde_json::to_value(DiscoveryMessage::Advertisement(ad("SRV1", 5001))).unwrap();
        assert_eq!(v["type"], "SERVER_ADVERTISEMENT");
        assert_eq!(v["hostname"], "SRV1");
        assert_eq!(v["port"], 5001);
        assert_eq!(v["is_windows"], true);
    }

    #[test]
    fn test_advertiser_answers_probe_on_loopback() {
        let mut cfg = Config::default();
        cfg.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.discovery_port = 0;
        cfg.poll_ms = 50;
        let token = CancelToken::new();
        let adv = Advertiser::spawn(&cfg, "SRV1".into(), 5001, token.clone()).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.send_to(b"not a probe", adv.local_addr()).unwrap();
        sock.send_to(DISCOVERY_PROBE, adv.local_addr()).unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        match DiscoveryMessage::parse(&buf[..n]) {
            Some(DiscoveryMessage::Advertisement(a)) => {
                assert_eq!(a.hostname, "SRV1");
                assert_eq!(a.port, 5001);
                assert_eq!(a.ip, "127.0.0.1");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        token.cancel();
        adv.join();
    }
}
