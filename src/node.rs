//! State and operations shared by the server and client roles

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::config::Config;
use crate::discovery::PeerTable;
use crate::error::{SessionError, TransferError};
use crate::events::{self, Event};
use crate::install::{CommandInstaller, Installer};
use crate::journal::TransferJournal;
use crate::net;
use crate::session::{self, CloseReason, SessionContext, SessionInfo};
use crate::storage;
use crate::token::CancelToken;
use crate::transfer::{CancelOutcome, TransferManager};
use crate::transform::SecureTransform;

// Upper bound on waiting for sessions to tear down during stop
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Optional collaborators a node can be started with
#[derive(Default, Clone)]
pub struct NodeOptions {
    /// Run on every fully received file; defaults to `install_command`
    pub installer: Option<Arc<dyn Installer>>,
    /// Seals control frames; payload bytes are never transformed
    pub transform: Option<Arc<dyn SecureTransform>>,
}

pub(crate) struct Node {
    pub ctx: Arc<SessionContext>,
    pub peers: Arc<PeerTable>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: Config, options: NodeOptions) -> Result<(Arc<Self>, Receiver<Event>)> {
        config.validate()?;
        storage::ensure_dir_exists(&config.download_dir)
            .context("prepare download directory")?;

        let (sink, rx) = events::channel();
        let mut transfers = TransferManager::new(sink.clone());
        if config.journal {
            let journal = TransferJournal::new(&config.download_dir);
            debug!(path = %journal.path().display(), "transfer journal enabled");
            transfers = transfers.with_journal(journal);
        }
        let installer = options.installer.or_else(|| {
            config
                .install_command
                .clone()
                .and_then(CommandInstaller::new)
                .map(|c| Arc::new(c) as Arc<dyn Installer>)
        });

        let ctx = Arc::new(SessionContext {
            hostname: config.hostname(),
            codec: FrameCodec::new(options.transform),
            sessions: session::SessionTable::new(),
            transfers,
            events: sink,
            installer,
            token: CancelToken::new(),
            on_close: OnceLock::new(),
            config,
        });
        let node = Arc::new(Self {
            ctx,
            peers: Arc::new(PeerTable::new()),
            workers: Mutex::new(Vec::new()),
        });
        Ok((node, rx))
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn token(&self) -> &CancelToken {
        &self.ctx.token
    }

    pub fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Open a session to `addr` unless one to that peer already exists
    pub fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<SessionInfo, SessionError> {
        if self.ctx.sessions.contains(addr.ip()) {
            return Err(SessionError::Duplicate(addr.ip()));
        }
        let cfg = &self.ctx.config;
        let stream = net::connect_stream(addr, cfg.local_ip, cfg.connect_timeout())?;
        session::start(&self.ctx, stream, true)
    }

    pub fn push(&self, peer: IpAddr, path: &Path) -> Result<Uuid, TransferError> {
        self.ctx.transfers.enqueue(peer, path)
    }

    /// Outbound jobs first, then the file currently being received
    pub fn cancel(&self, peer: IpAddr, file_name: &str) -> CancelOutcome {
        match self.ctx.transfers.cancel(peer, file_name) {
            CancelOutcome::NotFound if self.ctx.sessions.cancel_inbound(peer, file_name) => {
                CancelOutcome::Signalled
            }
            outcome => outcome,
        }
    }

    pub fn pending(&self, peer: IpAddr) -> Vec<String> {
        self.ctx.transfers.pending(peer)
    }

    pub fn disconnect(&self, peer: IpAddr) -> bool {
        self.ctx.sessions.close(peer, CloseReason::Local)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.ctx.sessions.list()
    }

    pub fn stop(&self) {
        if self.ctx.token.is_cancelled() && self.workers.lock().is_empty() {
            return;
        }
        info!("stopping");
        self.ctx.token.cancel();
        self.ctx.sessions.close_all(CloseReason::Local);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for h in workers {
            let _ = h.join();
        }
        let deadline = Instant::now() + STOP_GRACE;
        while !self.ctx.sessions.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
