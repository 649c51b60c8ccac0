//! Per-peer transfer queues and job state
//!
//! Each peer has one queue. Its session's send loop takes jobs off it one at
//! a time, so a peer never has two transfers in flight while different peers
//! proceed in parallel. Queues outlive sessions: jobs still queued when a
//! peer drops are sent after it reconnects.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransferError;
use crate::events::{Event, EventSink, TransferUpdate};
use crate::journal::TransferJournal;
use crate::protocol::percent;
use crate::storage;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    MetadataSent,
    InProgress,
    Completed,
    /// The receiver already had a file with this name and size
    AlreadyPresent,
    Cancelled,
    /// The session dropped before the transfer finished
    Disconnected,
    /// Local or remote I/O failure
    Failed(String),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::AlreadyPresent
                | Self::Cancelled
                | Self::Disconnected
                | Self::Failed(_)
        )
    }

    pub fn describe(&self, direction: Direction) -> String {
        let outbound = direction == Direction::Outbound;
        match self {
            Self::Queued => "queued".into(),
            Self::MetadataSent => "metadata sent".into(),
            Self::InProgress => "in progress".into(),
            Self::Completed if outbound => "sent".into(),
            Self::Completed => "received".into(),
            Self::AlreadyPresent if outbound => "sent already".into(),
            Self::AlreadyPresent => "received already".into(),
            Self::Cancelled => "cancelled".into(),
            Self::Disconnected if outbound => "not sent (disconnected)".into(),
            Self::Disconnected => "not received (disconnected)".into(),
            Self::Failed(reason) => format!("failed: {}", reason),
        }
    }
}

/// One file going to one peer
#[derive(Debug)]
pub struct TransferJob {
    pub id: Uuid,
    pub peer: IpAddr,
    pub source: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    cancel: Arc<AtomicBool>,
}

impl TransferJob {
    fn new(peer: IpAddr, source: &Path, file_name: String, file_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            source: source.to_path_buf(),
            file_name,
            file_size,
            bytes_transferred: 0,
            status: TransferStatus::Queued,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// First terminal status wins; anything after it is ignored.
    /// Returns whether the status changed.
    pub fn set_status(&mut self, status: TransferStatus) -> bool {
        if self.status.is_terminal() {
            if self.status != status {
                debug!(
                    file = %self.file_name,
                    current = ?self.status,
                    ignored = ?status,
                    "late status ignored"
                );
            }
            return false;
        }
        self.status = status;
        true
    }

    pub fn percent(&self) -> f64 {
        percent(self.bytes_transferred, self.file_size)
    }

    pub fn update(&self) -> TransferUpdate {
        TransferUpdate {
            job_id: self.id,
            peer: self.peer,
            direction: Direction::Outbound,
            file_name: self.file_name.clone(),
            status: self.status.clone(),
            bytes: self.bytes_transferred,
            total: self.file_size,
            percent: self.percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed before it started
    Dequeued,
    /// In flight; the sender stops at the next chunk boundary
    Signalled,
    NotFound,
}

struct InFlight {
    id: Uuid,
    file_name: String,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct PeerQueue {
    pending: VecDeque<TransferJob>,
    current: Option<InFlight>,
    wake: Option<Sender<()>>,
}

pub struct TransferManager {
    queues: Mutex<HashMap<IpAddr, PeerQueue>>,
    /// (peer, name, size) the peer reported as already present
    delivered: Mutex<HashSet<(IpAddr, String, u64)>>,
    events: EventSink,
    journal: Option<TransferJournal>,
}

impl TransferManager {
    pub fn new(events: EventSink) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashSet::new()),
            events,
            journal: None,
        }
    }

    /// Also append terminal states, both directions, to `journal`
    pub fn with_journal(mut self, journal: TransferJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Queue `path` for `peer`. The peer's send loop is woken if it is idle.
    pub fn enqueue(&self, peer: IpAddr, path: impl AsRef<Path>) -> Result<Uuid, TransferError> {
        let path = path.as_ref();
        let md = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(path.to_path_buf()),
            _ => TransferError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        if !md.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        std::fs::File::open(path).map_err(|e| TransferError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let name = storage::declared_name(path)
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;

        let mut job = TransferJob::new(peer, path, name, md.len());
        let id = job.id;

        let known = self
            .delivered
            .lock()
            .contains(&(peer, job.file_name.clone(), job.file_size));
        if known {
            info!(peer = %peer, file = %job.file_name, "peer already has this file, not resending");
            job.set_status(TransferStatus::AlreadyPresent);
            self.emit(&job);
            return Ok(id);
        }

        info!(peer = %peer, file = %job.file_name, bytes = job.file_size, "queued");
        self.emit(&job);
        let mut queues = self.queues.lock();
        let q = queues.entry(peer).or_default();
        q.pending.push_back(job);
        if let Some(wake) = &q.wake {
            let _ = wake.try_send(());
        }
        Ok(id)
    }

    /// Cancel by file name: a queued job is dropped, the in-flight one is
    /// flagged for its sender
    pub fn cancel(&self, peer: IpAddr, file_name: &str) -> CancelOutcome {
        let mut queues = self.queues.lock();
        let Some(q) = queues.get_mut(&peer) else {
            return CancelOutcome::NotFound;
        };
        if let Some(pos) = q.pending.iter().position(|j| j.file_name == file_name) {
            if let Some(mut job) = q.pending.remove(pos) {
                job.set_status(TransferStatus::Cancelled);
                info!(peer = %peer, file = %file_name, "queued transfer cancelled");
                self.emit(&job);
            }
            return CancelOutcome::Dequeued;
        }
        if let Some(cur) = &q.current {
            if cur.file_name == file_name {
                cur.cancel.store(true, Ordering::SeqCst);
                info!(peer = %peer, file = %file_name, "cancelling transfer in flight");
                return CancelOutcome::Signalled;
            }
        }
        CancelOutcome::NotFound
    }

    /// Names still waiting, in send order
    pub fn pending(&self, peer: IpAddr) -> Vec<String> {
        self.queues
            .lock()
            .get(&peer)
            .map(|q| q.pending.iter().map(|j| j.file_name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn in_flight(&self, peer: IpAddr) -> Option<String> {
        self.queues
            .lock()
            .get(&peer)
            .and_then(|q| q.current.as_ref().map(|c| c.file_name.clone()))
    }

    pub(crate) fn attach(&self, peer: IpAddr, wake: Sender<()>) {
        let mut queues = self.queues.lock();
        let q = queues.entry(peer).or_default();
        if !q.pending.is_empty() {
            let _ = wake.try_send(());
        }
        q.wake = Some(wake);
    }

    pub(crate) fn detach(&self, peer: IpAddr) {
        if let Some(q) = self.queues.lock().get_mut(&peer) {
            q.wake = None;
        }
    }

    /// Hand the next job to the peer's send loop, unless one is in flight
    pub(crate) fn begin_next(&self, peer: IpAddr) -> Option<TransferJob> {
        let mut queues = self.queues.lock();
        let q = queues.get_mut(&peer)?;
        if q.current.is_some() {
            return None;
        }
        let job = q.pending.pop_front()?;
        q.current = Some(InFlight {
            id: job.id,
            file_name: job.file_name.clone(),
            cancel: job.cancel.clone(),
        });
        Some(job)
    }

    /// The send loop is done with `job`
    pub(crate) fn finish(&self, job: &TransferJob) {
        if job.status == TransferStatus::AlreadyPresent {
            self.delivered
                .lock()
                .insert((job.peer, job.file_name.clone(), job.file_size));
        }
        let mut queues = self.queues.lock();
        if let Some(q) = queues.get_mut(&job.peer) {
            if q.current.as_ref().is_some_and(|c| c.id == job.id) {
                q.current = None;
            }
        }
    }

    pub(crate) fn emit(&self, job: &TransferJob) {
        self.report(job.update());
    }

    /// Publish a transfer update from either direction
    pub(crate) fn report(&self, update: TransferUpdate) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(&update) {
                warn!("cannot write transfer journal: {:#}", e);
            }
        }
        self.events.emit(Event::Transfer(update));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use std::net::Ipv4Addr;

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    fn statuses(rx: &crossbeam_channel::Receiver<Event>) -> Vec<(String, TransferStatus)> {
        rx.try_iter()
            .filter_map(|e| match e {
                Event::Transfer(u) => Some((u.file_name, u.status)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_enqueue_validates_source() {
        let (sink, _rx) = events::channel();
        let mgr = TransferManager::new(sink);
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope.exe");
        assert!(matches!(
            mgr.enqueue(peer(), &missing),
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            mgr.enqueue(peer(), dir.path()),
            Err(TransferError::NotAFile(_))
        ));
        assert!(mgr.pending(peer()).is_empty());
    }

    #[test]
    fn test_jobs_handed_out_one_at_a_time() {
        let (sink, rx) = events::channel();
        let mgr = TransferManager::new(sink);
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.msi", "b.msi"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
            mgr.enqueue(peer(), dir.path().join(name)).unwrap();
        }
        assert_eq!(mgr.pending(peer()), vec!["a.msi", "b.msi"]);

        let mut first = mgr.begin_next(peer()).unwrap();
        assert_eq!(first.file_name, "a.msi");
        assert!(mgr.begin_next(peer()).is_none());
        assert_eq!(mgr.in_flight(peer()).as_deref(), Some("a.msi"));

        first.set_status(TransferStatus::Completed);
        mgr.finish(&first);
        let second = mgr.begin_next(peer()).unwrap();
        assert_eq!(second.file_name, "b.msi");

        let seen = statuses(&rx);
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, s)| *s == TransferStatus::Queued));
    }

    #[test]
    fn test_cancel_queued_and_in_flight() {
        let (sink, rx) = events::channel();
        let mgr = TransferManager::new(sink);
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.exe", "b.exe"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
            mgr.enqueue(peer(), dir.path().join(name)).unwrap();
        }
        let running = mgr.begin_next(peer()).unwrap();
        assert!(!running.is_cancelled());

        assert_eq!(mgr.cancel(peer(), "b.exe"), CancelOutcome::Dequeued);
        assert_eq!(mgr.cancel(peer(), "a.exe"), CancelOutcome::Signalled);
        assert!(running.is_cancelled());
        assert_eq!(mgr.cancel(peer(), "zzz"), CancelOutcome::NotFound);
        assert_eq!(
            mgr.cancel(IpAddr::V4(Ipv4Addr::LOCALHOST), "a.exe"),
            CancelOutcome::NotFound
        );

        let seen = statuses(&rx);
        assert!(seen.contains(&("b.exe".to_string(), TransferStatus::Cancelled)));
        assert!(mgr.pending(peer()).is_empty());
    }

    #[test]
    fn test_already_present_is_remembered() {
        let (sink, rx) = events::channel();
        let mgr = TransferManager::new(sink);
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("setup.exe");
        std::fs::write(&f, b"payload").unwrap();

        mgr.enqueue(peer(), &f).unwrap();
        let mut job = mgr.begin_next(peer()).unwrap();
        job.set_status(TransferStatus::AlreadyPresent);
        mgr.finish(&job);
        let _ = statuses(&rx);

        mgr.enqueue(peer(), &f).unwrap();
        assert!(mgr.pending(peer()).is_empty());
        assert_eq!(
            statuses(&rx),
            vec![("setup.exe".to_string(), TransferStatus::AlreadyPresent)]
        );
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x");
        std::fs::write(&f, b"1").unwrap();
        let mut job = TransferJob::new(peer(), &f, "x".into(), 1);
        assert!(job.set_status(TransferStatus::InProgress));
        assert!(job.set_status(TransferStatus::Completed));
        assert!(!job.set_status(TransferStatus::Cancelled));
        assert_eq!(job.status, TransferStatus::Completed);
    }

    #[test]
    fn test_describe_distinguishes_failure_kinds() {
        let out = Direction::Outbound;
        let inc = Direction::Inbound;
        assert_eq!(TransferStatus::Disconnected.describe(out), "not sent (disconnected)");
        assert_eq!(TransferStatus::Disconnected.describe(inc), "not received (disconnected)");
        assert_eq!(TransferStatus::AlreadyPresent.describe(out), "sent already");
        assert_ne!(
            TransferStatus::Cancelled.describe(out),
            TransferStatus::Failed("disk full".into()).describe(out)
        );
    }
}
