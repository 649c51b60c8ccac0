//! Admin side: advertises itself, accepts agents and pushes files to them

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::Advertiser;
use crate::error::{SessionError, TransferError};
use crate::events::Event;
use crate::message::PeerIdentity;
use crate::net;
use crate::node::{Node, NodeOptions};
use crate::session::{self, SessionInfo};
use crate::transfer::CancelOutcome;

pub struct Server {
    node: Arc<Node>,
    local_addr: SocketAddr,
    advertiser: Mutex<Option<Advertiser>>,
    discovery_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind the session port and start accepting. Failing to bind is an
    /// error; failing to advertise is reported as
    /// [`Event::DiscoveryUnavailable`] and the server keeps running.
    pub fn start(config: Config, options: NodeOptions) -> Result<(Self, Receiver<Event>)> {
        let (node, events) = Node::new(config, options)?;
        let cfg = node.config();
        let listener = net::bind_listener(cfg.bind_ip, cfg.session_port)
            .with_context(|| format!("bind session port {}:{}", cfg.bind_ip, cfg.session_port))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, host = %node.ctx.hostname, "server listening");

        let advertiser = if cfg.discovery_enabled {
            match Advertiser::spawn(
                cfg,
                node.ctx.hostname.clone(),
                local_addr.port(),
                node.token().child(),
            ) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("discovery unavailable: {:#}", e);
                    node.ctx
                        .events
                        .emit(Event::DiscoveryUnavailable(format!("{:#}", e)));
                    None
                }
            }
        } else {
            None
        };
        let discovery_addr = advertiser.as_ref().map(|a| a.local_addr());

        let accept_node = node.clone();
        let handle = std::thread::Builder::new()
            .name("lanpush-accept".into())
            .spawn(move || accept_loop(accept_node, listener))?;
        node.add_worker(handle);

        Ok((
            Self {
                node,
                local_addr,
                advertiser: Mutex::new(advertiser),
                discovery_addr,
            },
            events,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where the advertiser listens, if discovery started
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr
    }

    /// Queue a file for one connected (or soon reconnecting) agent
    pub fn push(&self, peer: IpAddr, path: impl AsRef<Path>) -> Result<Uuid, TransferError> {
        self.node.push(peer, path.as_ref())
    }

    /// Queue a file for every agent currently connected
    pub fn push_all(&self, path: impl AsRef<Path>) -> Vec<(IpAddr, Result<Uuid, TransferError>)> {
        self.node
            .sessions()
            .into_iter()
            .map(|s| (s.peer, self.node.push(s.peer, path.as_ref())))
            .collect()
    }

    pub fn cancel(&self, peer: IpAddr, file_name: &str) -> CancelOutcome {
        self.node.cancel(peer, file_name)
    }

    pub fn pending(&self, peer: IpAddr) -> Vec<String> {
        self.node.pending(peer)
    }

    pub fn disconnect(&self, peer: IpAddr) -> bool {
        self.node.disconnect(peer)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.node.sessions()
    }

    /// Identities of connected agents
    pub fn peers(&self) -> Vec<(IpAddr, PeerIdentity)> {
        self.node
            .sessions()
            .into_iter()
            .filter_map(|s| s.identity.map(|id| (s.peer, id)))
            .collect()
    }

    pub fn stop(&self) {
        self.node.stop();
        if let Some(a) = self.advertiser.lock().take() {
            a.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(node: Arc<Node>, listener: TcpListener) {
    let pause = node.config().poll().min(Duration::from_millis(100));
    while !node.token().is_cancelled() {
        match listener.accept() {
            Ok((stream, addr)) => match session::start(&node.ctx, stream, false) {
                Ok(_) => {}
                Err(SessionError::Duplicate(ip)) => {
                    info!(peer = %ip, "already connected, dropping new connection");
                }
                Err(e) => warn!(peer = %addr, "session setup failed: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(pause),
            Err(e) => {
                warn!("accept failed: {}", e);
                std::thread::sleep(pause);
            }
        }
    }
}
