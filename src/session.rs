//! One live TCP connection between two peers
//!
//! Each session runs three threads. The receive loop is the only reader and
//! owns teardown. The send loop is the only writer: control frames produced
//! anywhere in the process reach the socket through its channel, and file
//! payload is written only by it, never interleaved with a frame. The
//! heartbeat thread queues a `HEARTBEAT` on that channel at a fixed period.
//!
//! Sessions are symmetric. Either side may send files, so the same code runs
//! on a server that accepted the connection and on a client that dialed it.
//!
//! A sender that abandons a file part way (local cancel, early verdict from
//! the receiver) cannot put another frame on the wire, so it closes the
//! session with [`CloseReason::Resync`]. That close takes the whole
//! connection down: a file arriving in the other direction at the same time
//! ends as `Disconnected`, and the peer sees the abandoned file as "not
//! received (disconnected)" rather than cancelled. Queued outbound jobs stay
//! queued and resume on the next session.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{Decoded, FrameCodec};
use crate::config::Config;
use crate::error::SessionError;
use crate::events::{Event, EventSink};
use crate::inbound::{InboundTransfer, Step};
use crate::install::Installer;
use crate::message::{AckStatus, ControlFrame, PeerIdentity, RemoteStatus};
use crate::net;
use crate::token::CancelToken;
use crate::transfer::{TransferJob, TransferManager, TransferStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request from this side
    Local,
    PeerClosed,
    IdleTimeout,
    /// A payload was abandoned part way, so the stream had to be dropped
    Resync,
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Resync => f.write_str("dropped to resynchronize stream"),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: IpAddr,
    /// Remote socket address; for a dialed session, the server's session port
    pub addr: SocketAddr,
    pub outbound: bool,
    /// Filled in once the peer's `CLIENT_INFO` arrives
    pub identity: Option<PeerIdentity>,
    pub opened_at: DateTime<Utc>,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct InboundSlot {
    current: Option<String>,
    cancel_requested: bool,
}

/// State reachable from outside the session threads
struct Shared {
    generation: u64,
    token: CancelToken,
    stream: TcpStream,
    reason: Mutex<Option<CloseReason>>,
    inbound: Mutex<InboundSlot>,
}

impl Shared {
    /// First reason wins
    fn close(&self, reason: CloseReason) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.token.cancel();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }
}

struct Entry {
    info: SessionInfo,
    shared: Arc<Shared>,
}

/// Live sessions, at most one per peer address
#[derive(Default)]
pub struct SessionTable {
    entries: Mutex<HashMap<IpAddr, Entry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_insert(&self, info: SessionInfo, shared: Arc<Shared>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&info.peer) {
            return false;
        }
        entries.insert(info.peer, Entry { info, shared });
        true
    }

    /// Only removes the entry if it is still the same session
    fn remove(&self, peer: IpAddr, generation: u64) {
        let mut entries = self.entries.lock();
        if entries
            .get(&peer)
            .is_some_and(|e| e.shared.generation == generation)
        {
            entries.remove(&peer);
        }
    }

    fn set_identity(&self, peer: IpAddr, generation: u64, identity: PeerIdentity) {
        if let Some(e) = self.entries.lock().get_mut(&peer) {
            if e.shared.generation == generation {
                e.info.identity = Some(identity);
            }
        }
    }

    pub fn contains(&self, peer: IpAddr) -> bool {
        self.entries.lock().contains_key(&peer)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut v: Vec<SessionInfo> = self.entries.lock().values().map(|e| e.info.clone()).collect();
        v.sort_by_key(|i| i.peer);
        v
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self, peer: IpAddr, reason: CloseReason) -> bool {
        let shared = self.entries.lock().get(&peer).map(|e| e.shared.clone());
        match shared {
            Some(s) => {
                s.close(reason);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self, reason: CloseReason) {
        let all: Vec<Arc<Shared>> = self.entries.lock().values().map(|e| e.shared.clone()).collect();
        for s in all {
            s.close(reason.clone());
        }
    }

    /// Ask the receive loop to abandon the file it is currently receiving
    pub fn cancel_inbound(&self, peer: IpAddr, file_name: &str) -> bool {
        let shared = self.entries.lock().get(&peer).map(|e| e.shared.clone());
        let Some(s) = shared else {
            return false;
        };
        let mut slot = s.inbound.lock();
        if slot.current.as_deref() == Some(file_name) {
            slot.cancel_requested = true;
            true
        } else {
            false
        }
    }
}

pub type CloseHook = Box<dyn Fn(&SessionInfo, &CloseReason) + Send + Sync>;

/// Everything a node's sessions share
pub(crate) struct SessionContext {
    pub config: Config,
    pub hostname: String,
    pub codec: FrameCodec,
    pub sessions: SessionTable,
    pub transfers: TransferManager,
    pub events: EventSink,
    pub installer: Option<Arc<dyn Installer>>,
    pub token: CancelToken,
    pub on_close: OnceLock<CloseHook>,
}

/// Bring up a session on a connected stream: register it, send our identity
/// and start its threads
pub(crate) fn start(
    ctx: &Arc<SessionContext>,
    stream: TcpStream,
    outbound: bool,
) -> Result<SessionInfo, SessionError> {
    if ctx.token.is_cancelled() {
        return Err(SessionError::Stopped);
    }
    let addr = stream.peer_addr()?;
    let peer = addr.ip();
    net::tune_stream(&stream, ctx.config.poll(), ctx.config.io_timeout())?;

    let shared = Arc::new(Shared {
        generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        token: ctx.token.child(),
        stream: stream.try_clone()?,
        reason: Mutex::new(None),
        inbound: Mutex::new(InboundSlot::default()),
    });
    let info = SessionInfo {
        peer,
        addr,
        outbound,
        identity: None,
        opened_at: Utc::now(),
    };
    if !ctx.sessions.try_insert(info.clone(), shared.clone()) {
        let _ = stream.shutdown(Shutdown::Both);
        return Err(SessionError::Duplicate(peer));
    }

    match launch(ctx, &shared, &info, stream) {
        Ok(()) => {
            info!(peer = %addr, outbound, "session opened");
            Ok(info)
        }
        Err(e) => {
            shared.close(CloseReason::Error(e.to_string()));
            ctx.transfers.detach(peer);
            ctx.sessions.remove(peer, shared.generation);
            Err(e)
        }
    }
}

fn launch(
    ctx: &Arc<SessionContext>,
    shared: &Arc<Shared>,
    info: &SessionInfo,
    stream: TcpStream,
) -> Result<(), SessionError> {
    let mut writer = stream.try_clone()?;
    let local_ip = stream.local_addr()?.ip();
    let hello = ControlFrame::Identity(PeerIdentity::new(ctx.hostname.clone(), local_ip.to_string()));
    writer.write_all(&ctx.codec.encode(&hello)?)?;

    let (control_tx, control_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    let (wake_tx, wake_rx) = bounded(1);
    ctx.transfers.attach(info.peer, wake_tx);

    let send = SendLoop {
        ctx: ctx.clone(),
        shared: shared.clone(),
        peer: info.peer,
        stream: writer,
        control: control_rx,
        wake: wake_rx,
        acks: ack_rx,
    };
    let send_handle = std::thread::Builder::new()
        .name(format!("lanpush-send-{}", info.peer))
        .spawn(move || send.run())?;

    let hb_token = shared.token.clone();
    let hb_tx = control_tx.clone();
    let (period, poll) = (ctx.config.heartbeat(), ctx.config.poll());
    let hb_handle = std::thread::Builder::new()
        .name(format!("lanpush-heartbeat-{}", info.peer))
        .spawn(move || {
            while hb_token.sleep(period, poll) {
                if hb_tx.send(ControlFrame::Heartbeat).is_err() {
                    break;
                }
            }
        })?;

    let recv = ReceiveLoop {
        ctx: ctx.clone(),
        shared: shared.clone(),
        info: info.clone(),
        stream,
        control: control_tx,
        acks: ack_tx,
        inbound: None,
        identified: false,
        reported_handshake: false,
        workers: vec![send_handle, hb_handle],
    };
    std::thread::Builder::new()
        .name(format!("lanpush-recv-{}", info.peer))
        .spawn(move || recv.run())?;
    Ok(())
}

struct ReceiveLoop {
    ctx: Arc<SessionContext>,
    shared: Arc<Shared>,
    info: SessionInfo,
    stream: TcpStream,
    control: Sender<ControlFrame>,
    acks: Sender<ControlFrame>,
    inbound: Option<InboundTransfer>,
    identified: bool,
    reported_handshake: bool,
    workers: Vec<JoinHandle<()>>,
}

impl ReceiveLoop {
    fn run(mut self) {
        let reason = self.read_until_closed();
        self.teardown(reason);
    }

    fn read_until_closed(&mut self) -> CloseReason {
        let mut decoder = self.ctx.codec.decoder();
        let mut buf = vec![0u8; self.ctx.config.chunk_size.max(4096)];
        let idle_limit = self.ctx.config.io_timeout();
        let mut last_read = Instant::now();

        loop {
            if self.shared.token.is_cancelled() {
                return self.shared.reason().unwrap_or(CloseReason::Local);
            }
            match self.stream.read(&mut buf) {
                // a local shutdown also reads as EOF
                Ok(0) => return self.shared.reason().unwrap_or(CloseReason::PeerClosed),
                Ok(n) => {
                    last_read = Instant::now();
                    decoder.feed(&buf[..n]);
                    while let Some(item) = decoder.next_item() {
                        self.dispatch(item);
                    }
                }
                Err(e) if net::is_timeout(&e) => {
                    if last_read.elapsed() > idle_limit {
                        warn!(peer = %self.info.addr, "no data for {:?}", idle_limit);
                        return CloseReason::IdleTimeout;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return self
                        .shared
                        .reason()
                        .unwrap_or_else(|| CloseReason::Error(format!("read: {}", e)));
                }
            }
            self.poll_local_cancel();
        }
    }

    fn dispatch(&mut self, item: Decoded) {
        let frame = match item {
            Decoded::Payload(data) => {
                self.on_payload(&data);
                return;
            }
            Decoded::Malformed(detail) => {
                self.violation(format!("malformed frame discarded: {}", detail));
                return;
            }
            Decoded::Frame(frame) => frame,
        };
        debug!(peer = %self.info.peer, kind = frame.kind(), "frame received");

        if !self.identified && !matches!(frame, ControlFrame::Identity(_)) && !self.reported_handshake {
            self.reported_handshake = true;
            self.violation(format!("expected CLIENT_INFO first, got {}", frame.kind()));
        }

        match frame {
            ControlFrame::Identity(identity) => {
                if self.identified {
                    self.violation("repeated CLIENT_INFO ignored".to_string());
                    return;
                }
                self.identified = true;
                info!(
                    peer = %self.info.peer,
                    host = %identity.hostname,
                    os = %identity.os_type,
                    "peer identified"
                );
                self.ctx
                    .sessions
                    .set_identity(self.info.peer, self.shared.generation, identity.clone());
                self.ctx.events.emit(Event::SessionOpened {
                    peer: self.info.peer,
                    identity,
                });
            }
            ControlFrame::FileMetadata {
                file_name,
                file_size,
            } => self.on_metadata(&file_name, file_size),
            ControlFrame::FileAck { .. } => {
                let _ = self.acks.send(frame);
            }
            ControlFrame::StatusUpdate {
                ref file_name,
                status,
                ref message,
            } => {
                info!(peer = %self.info.peer, file = %file_name, %status, "peer reported");
                self.ctx.events.emit(Event::RemoteStatus {
                    peer: self.info.peer,
                    file_name: file_name.clone(),
                    status,
                    message: message.clone(),
                });
                let _ = self.acks.send(frame);
            }
            ControlFrame::CancelTransfer { ref file_name } => {
                let ours = self
                    .inbound
                    .as_ref()
                    .is_some_and(|t| t.file_name() == file_name);
                if ours {
                    if let Some(t) = self.inbound.as_mut() {
                        t.cancelled_by_peer(&self.ctx.transfers);
                    }
                } else {
                    let _ = self.acks.send(frame);
                }
            }
            ControlFrame::Heartbeat => {}
        }
    }

    fn on_metadata(&mut self, file_name: &str, file_size: u64) {
        if let Some(prev) = self.inbound.take() {
            // the decoder only parses frames once a payload is complete
            debug!(file = %prev.file_name(), "previous inbound transfer replaced");
        }
        let (t, step) = InboundTransfer::start(
            &self.ctx.config.download_dir,
            self.info.peer,
            file_name,
            file_size,
            &self.ctx.transfers,
        );
        self.apply(step);
        if !t.is_finished() {
            let mut slot = self.shared.inbound.lock();
            slot.current = Some(file_name.to_string());
            slot.cancel_requested = false;
            drop(slot);
            self.inbound = Some(t);
        }
    }

    fn on_payload(&mut self, data: &[u8]) {
        let Some(t) = self.inbound.as_mut() else {
            debug!(peer = %self.info.peer, len = data.len(), "payload with no transfer");
            return;
        };
        let step = t.write(data, &self.ctx.transfers);
        let finished = t.is_finished();
        self.apply(step);
        if finished {
            self.inbound = None;
            *self.shared.inbound.lock() = InboundSlot::default();
        }
    }

    fn poll_local_cancel(&mut self) {
        let requested = std::mem::take(&mut self.shared.inbound.lock().cancel_requested);
        if !requested {
            return;
        }
        if let Some(t) = self.inbound.as_mut() {
            let step = t.cancel_locally(&self.ctx.transfers);
            self.apply(step);
        }
    }

    fn apply(&self, step: Step) {
        if let Some(reply) = step.reply {
            let _ = self.control.send(reply);
        }
        if let Some(path) = step.ready {
            self.run_installer(path);
        }
    }

    fn run_installer(&self, path: PathBuf) {
        let Some(installer) = self.ctx.installer.clone() else {
            return;
        };
        let control = self.control.clone();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let spawned = std::thread::Builder::new()
            .name("lanpush-install".into())
            .spawn(move || {
                let status = RemoteStatus::from(installer.install(&path));
                let _ = control.send(ControlFrame::StatusUpdate {
                    file_name,
                    status,
                    message: None,
                });
            });
        if let Err(e) = spawned {
            warn!("cannot start installer thread: {}", e);
        }
    }

    fn violation(&self, detail: String) {
        warn!(peer = %self.info.peer, "protocol violation: {}", detail);
        self.ctx.events.emit(Event::ProtocolViolation {
            peer: self.info.peer,
            detail,
        });
    }

    fn teardown(mut self, reason: CloseReason) {
        if let Some(t) = self.inbound.take() {
            t.disconnected(&self.ctx.transfers);
        }
        self.shared.close(reason);
        let reason = self.shared.reason().unwrap_or(CloseReason::Local);
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
        self.ctx.transfers.detach(self.info.peer);
        self.ctx.sessions.remove(self.info.peer, self.shared.generation);
        info!(peer = %self.info.addr, %reason, "session closed");
        self.ctx.events.emit(Event::SessionClosed {
            peer: self.info.peer,
            reason: reason.clone(),
        });
        if let Some(hook) = self.ctx.on_close.get() {
            hook(&self.info, &reason);
        }
    }
}

/// How an outbound file ended, as judged from a peer frame
fn verdict(frame: &ControlFrame, file_name: &str) -> Option<TransferStatus> {
    match frame {
        ControlFrame::FileAck { file_name: f, status } if f == file_name => Some(match status {
            AckStatus::Received => TransferStatus::Completed,
            AckStatus::ReceivedAlready => TransferStatus::AlreadyPresent,
        }),
        ControlFrame::StatusUpdate {
            file_name: f,
            status,
            message,
        } if f == file_name => match status {
            RemoteStatus::Failed => Some(TransferStatus::Failed(
                message.clone().unwrap_or_else(|| "failed on receiver".into()),
            )),
            RemoteStatus::Cancelled => Some(TransferStatus::Cancelled),
            RemoteStatus::Disconnected => Some(TransferStatus::Disconnected),
            _ => None,
        },
        ControlFrame::CancelTransfer { file_name: f } if f == file_name => {
            Some(TransferStatus::Cancelled)
        }
        _ => None,
    }
}

struct SendLoop {
    ctx: Arc<SessionContext>,
    shared: Arc<Shared>,
    peer: IpAddr,
    stream: TcpStream,
    control: Receiver<ControlFrame>,
    wake: Receiver<()>,
    acks: Receiver<ControlFrame>,
}

impl SendLoop {
    fn run(mut self) {
        if let Err(reason) = self.serve() {
            self.shared.close(reason);
        }
        debug!(peer = %self.peer, "send loop stopped");
    }

    fn serve(&mut self) -> Result<(), CloseReason> {
        let poll = self.ctx.config.poll();
        let (control, wake) = (self.control.clone(), self.wake.clone());
        while !self.shared.token.is_cancelled() {
            self.flush_control()?;
            if let Some(mut job) = self.ctx.transfers.begin_next(self.peer) {
                let result = self.send_file(&mut job);
                if !job.status.is_terminal() {
                    job.set_status(TransferStatus::Disconnected);
                    self.ctx.transfers.emit(&job);
                }
                self.ctx.transfers.finish(&job);
                result?;
                continue;
            }
            select! {
                recv(control) -> msg => match msg {
                    Ok(frame) => self.write_frame(&frame)?,
                    Err(_) => return Ok(()),
                },
                recv(wake) -> msg => {
                    if msg.is_err() {
                        return Ok(());
                    }
                }
                default(poll) => {}
            }
        }
        Ok(())
    }

    fn flush_control(&mut self) -> Result<(), CloseReason> {
        while let Ok(frame) = self.control.try_recv() {
            self.write_frame(&frame)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &ControlFrame) -> Result<(), CloseReason> {
        let bytes = match self.ctx.codec.encode(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!(peer = %self.peer, kind = frame.kind(), "frame not sent: {}", e);
                return Ok(());
            }
        };
        self.stream
            .write_all(&bytes)
            .map_err(|e| CloseReason::Error(format!("write: {}", e)))?;
        debug!(peer = %self.peer, kind = frame.kind(), "frame sent");
        Ok(())
    }

    fn settle(&self, job: &mut TransferJob, status: TransferStatus) {
        if job.set_status(status) {
            info!(
                peer = %self.peer,
                file = %job.file_name,
                status = %job.status.describe(crate::transfer::Direction::Outbound),
                "transfer finished"
            );
            self.ctx.transfers.emit(job);
        }
    }

    /// Stream one job. `Err` means the session must close; the job's own
    /// status is always settled before returning.
    fn send_file(&mut self, job: &mut TransferJob) -> Result<(), CloseReason> {
        // anything still queued refers to an earlier file
        while self.acks.try_recv().is_ok() {}

        if job.is_cancelled() {
            self.settle(job, TransferStatus::Cancelled);
            return Ok(());
        }
        let mut file = match File::open(&job.source) {
            Ok(f) => f,
            Err(e) => {
                self.settle(job, TransferStatus::Failed(format!("cannot open source: {}", e)));
                return Ok(());
            }
        };

        let meta = ControlFrame::FileMetadata {
            file_name: job.file_name.clone(),
            file_size: job.file_size,
        };
        let bytes = match self.ctx.codec.encode(&meta) {
            Ok(b) => b,
            Err(e) => {
                self.settle(job, TransferStatus::Failed(e.to_string()));
                return Ok(());
            }
        };
        if let Err(e) = self.stream.write_all(&bytes) {
            self.settle(job, TransferStatus::Disconnected);
            return Err(CloseReason::Error(format!("write: {}", e)));
        }
        info!(peer = %self.peer, file = %job.file_name, bytes = job.file_size, "sending");
        job.set_status(TransferStatus::MetadataSent);
        self.ctx.transfers.emit(job);
        job.set_status(TransferStatus::InProgress);
        self.ctx.transfers.emit(job);

        let mut buf = vec![0u8; self.ctx.config.chunk_size];
        while job.bytes_transferred < job.file_size {
            if self.shared.token.is_cancelled() {
                self.settle(job, TransferStatus::Disconnected);
                return Ok(());
            }
            if job.is_cancelled() {
                self.settle(job, TransferStatus::Cancelled);
                return Err(CloseReason::Resync);
            }
            while let Ok(frame) = self.acks.try_recv() {
                if let Some(status) = verdict(&frame, &job.file_name) {
                    debug!(file = %job.file_name, ?status, "receiver ended transfer early");
                    self.settle(job, status);
                    return Err(CloseReason::Resync);
                }
            }

            let want = ((job.file_size - job.bytes_transferred) as usize).min(buf.len());
            let n = match file.read(&mut buf[..want]) {
                Ok(0) => {
                    self.settle(job, TransferStatus::Failed("source file shrank".into()));
                    return Err(CloseReason::Resync);
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.settle(job, TransferStatus::Failed(format!("read failed: {}", e)));
                    return Err(CloseReason::Resync);
                }
            };
            if let Err(e) = self.stream.write_all(&buf[..n]) {
                self.settle(job, TransferStatus::Disconnected);
                return Err(CloseReason::Error(format!("write: {}", e)));
            }
            job.bytes_transferred += n as u64;
            self.ctx.transfers.emit(job);
        }

        self.await_verdict(job)
    }

    /// Wait for the receiver's verdict while still relaying control frames,
    /// since the peer may be waiting on one of ours. Every payload byte is
    /// already on the wire, so a local cancel from here on is too late: the
    /// receiver's verdict stands.
    fn await_verdict(&mut self, job: &mut TransferJob) -> Result<(), CloseReason> {
        let deadline = Instant::now() + self.ctx.config.io_timeout();
        let poll = self.ctx.config.poll();
        let (acks, control) = (self.acks.clone(), self.control.clone());
        let mut late_cancel_seen = false;
        loop {
            if self.shared.token.is_cancelled() {
                self.settle(job, TransferStatus::Disconnected);
                return Ok(());
            }
            if job.is_cancelled() && !late_cancel_seen {
                late_cancel_seen = true;
                debug!(file = %job.file_name, "cancel after last byte ignored, awaiting verdict");
            }
            if Instant::now() >= deadline {
                self.settle(job, TransferStatus::Failed("no acknowledgement from receiver".into()));
                return Ok(());
            }
            select! {
                recv(acks) -> msg => match msg {
                    Ok(frame) => {
                        if let Some(status) = verdict(&frame, &job.file_name) {
                            self.settle(job, status);
                            return Ok(());
                        }
                    }
                    Err(_) => {
                        self.settle(job, TransferStatus::Disconnected);
                        return Ok(());
                    }
                },
                recv(control) -> msg => {
                    if let Ok(frame) = msg {
                        self.write_frame(&frame)?;
                    }
                }
                default(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_matches_only_current_file() {
        let ack = ControlFrame::FileAck {
            file_name: "a.exe".into(),
            status: AckStatus::Received,
        };
        assert_eq!(verdict(&ack, "a.exe"), Some(TransferStatus::Completed));
        assert_eq!(verdict(&ack, "b.exe"), None);

        let dup = ControlFrame::FileAck {
            file_name: "a.exe".into(),
            status: AckStatus::ReceivedAlready,
        };
        assert_eq!(verdict(&dup, "a.exe"), Some(TransferStatus::AlreadyPresent));

        let installed = ControlFrame::StatusUpdate {
            file_name: "a.exe".into(),
            status: RemoteStatus::Installed,
            message: None,
        };
        assert_eq!(verdict(&installed, "a.exe"), None);

        let failed = ControlFrame::StatusUpdate {
            file_name: "a.exe".into(),
            status: RemoteStatus::Failed,
            message: Some("disk full".into()),
        };
        assert_eq!(
            verdict(&failed, "a.exe"),
            Some(TransferStatus::Failed("disk full".into()))
        );
        assert_eq!(
            verdict(
                &ControlFrame::CancelTransfer {
                    file_name: "a.exe".into()
                },
                "a.exe"
            ),
            Some(TransferStatus::Cancelled)
        );
        assert_eq!(verdict(&ControlFrame::Heartbeat, "a.exe"), None);
    }

    #[test]
    fn test_table_rejects_duplicates_and_stale_removal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let b = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let mk = |stream: TcpStream, generation: u64| {
            Arc::new(Shared {
                generation,
                token: CancelToken::new(),
                stream,
                reason: Mutex::new(None),
                inbound: Mutex::new(InboundSlot::default()),
            })
        };
        let info = SessionInfo {
            peer,
            addr: listener.local_addr().unwrap(),
            outbound: true,
            identity: None,
            opened_at: Utc::now(),
        };
        let table = SessionTable::new();
        assert!(table.try_insert(info.clone(), mk(a, 1)));
        assert!(!table.try_insert(info.clone(), mk(b, 2)));
        assert!(table.contains(peer));

        // a stale generation never removes the live entry
        table.remove(peer, 2);
        assert_eq!(table.len(), 1);
        assert!(!table.cancel_inbound(peer, "x"));

        assert!(table.close(peer, CloseReason::Local));
        table.remove(peer, 1);
        assert!(table.is_empty());
        assert!(!table.close(peer, CloseReason::Local));
    }

    #[test]
    fn test_first_close_reason_wins() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let s = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let shared = Shared {
            generation: 1,
            token: CancelToken::new(),
            stream: s,
            reason: Mutex::new(None),
            inbound: Mutex::new(InboundSlot::default()),
        };
        shared.close(CloseReason::Resync);
        shared.close(CloseReason::Local);
        assert_eq!(shared.reason(), Some(CloseReason::Resync));
        assert!(shared.token.is_cancelled());
    }
}
