//! Agent side: finds servers, keeps a session to each and receives files

use anyhow::Result;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{Discoverer, PeerObserver, PeerRecord};
use crate::error::{SessionError, TransferError};
use crate::events::Event;
use crate::node::{Node, NodeOptions};
use crate::reconnect::ReconnectSupervisor;
use crate::session::{CloseReason, SessionInfo};
use crate::transfer::CancelOutcome;

pub struct Client {
    node: Arc<Node>,
    supervisor: Arc<ReconnectSupervisor>,
    discoverer: Mutex<Option<Discoverer>>,
}

impl Client {
    pub fn start(config: crate::config::Config, options: NodeOptions) -> Result<(Self, Receiver<Event>)> {
        let (node, events) = Node::new(config, options)?;
        let cfg = node.config();
        let supervisor = Arc::new(ReconnectSupervisor::new(
            cfg.reconnect_initial(),
            cfg.reconnect_max(),
            cfg.poll(),
            node.ctx.events.clone(),
            node.token().child(),
        ));

        // Dialed sessions that drop for any reason but a local close are retried
        let weak = Arc::downgrade(&node);
        let sup = supervisor.clone();
        let _ = node.ctx.on_close.set(Box::new(move |info: &SessionInfo, reason: &CloseReason| {
            if !info.outbound || *reason == CloseReason::Local {
                return;
            }
            let Some(node) = weak.upgrade() else {
                return;
            };
            if node.token().is_cancelled() {
                return;
            }
            info!(addr = %info.addr, %reason, "session lost, reconnecting");
            schedule(&sup, &node, info.addr);
        }));

        let discoverer = if cfg.discovery_enabled {
            let on_new: Option<PeerObserver> = if cfg.auto_connect {
                let weak = Arc::downgrade(&node);
                let sup = supervisor.clone();
                Some(Box::new(move |rec: &PeerRecord| {
                    if let Some(node) = weak.upgrade() {
                        schedule(&sup, &node, rec.session_addr());
                    }
                }))
            } else {
                None
            };
            match Discoverer::spawn(
                cfg,
                node.peers.clone(),
                node.ctx.events.clone(),
                on_new,
                node.token().child(),
            ) {
                Ok(d) => Some(d),
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

        Ok((
            Self {
                node,
                supervisor,
                discoverer: Mutex::new(discoverer),
            },
            events,
        ))
    }

    /// One connection attempt, no retries
    pub fn connect(&self, addr: SocketAddr) -> Result<SessionInfo, SessionError> {
        self.node.dial(addr)
    }

    /// Connect now and keep retrying with backoff until it succeeds. Returns
    /// false if a retry loop for `addr` is already running.
    pub fn connect_with_retry(&self, addr: SocketAddr) -> bool {
        schedule(&self.supervisor, &self.node, addr)
    }

    pub fn is_reconnecting(&self, addr: SocketAddr) -> bool {
        self.supervisor.is_active(addr)
    }

    /// Queue a file for a connected server
    pub fn send(&self, peer: IpAddr, path: impl AsRef<Path>) -> Result<Uuid, TransferError> {
        self.node.push(peer, path.as_ref())
    }

    pub fn cancel(&self, peer: IpAddr, file_name: &str) -> CancelOutcome {
        self.node.cancel(peer, file_name)
    }

    pub fn pending(&self, peer: IpAddr) -> Vec<String> {
        self.node.pending(peer)
    }

    /// Close the session to `peer`; it is not reconnected
    pub fn disconnect(&self, peer: IpAddr) -> bool {
        self.node.disconnect(peer)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.node.sessions()
    }

    /// Servers found by discovery
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.node.peers.snapshot()
    }

    pub fn stop(&self) {
        self.node.stop();
        if let Some(d) = self.discoverer.lock().take() {
            d.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule(sup: &ReconnectSupervisor, node: &Arc<Node>, addr: SocketAddr) -> bool {
    if node.ctx.sessions.contains(addr.ip()) {
        debug!(addr = %addr, "already connected");
        return false;
    }
    let weak: Weak<Node> = Arc::downgrade(node);
    sup.schedule(addr, move || {
        let Some(node) = weak.upgrade() else {
            return true;
        };
        match node.dial(addr) {
            Ok(_) | Err(SessionError::Duplicate(_)) => true,
            Err(e) => {
                debug!(addr = %addr, "connect failed: {}", e);
                false
            }
        }
    })
}
