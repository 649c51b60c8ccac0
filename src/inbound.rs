//! Receiving side of one announced file
//!
//! Created when a `FILE_METADATA` frame arrives and fed the payload bytes the
//! decoder hands out for it. Bytes go to `<name>.part` and are renamed into
//! place only once the declared length has been written and synced, so a
//! final file is never a truncated one.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::TransferUpdate;
use crate::message::{AckStatus, ControlFrame, RemoteStatus};
use crate::protocol::{percent, CHUNK_SIZE};
use crate::storage;
use crate::transfer::{Direction, TransferManager, TransferStatus};

enum Sink {
    Write(BufWriter<File>),
    /// Payload is consumed and dropped
    Discard,
}

/// What the session has to do after a step
#[derive(Debug, Default)]
pub(crate) struct Step {
    /// Frame to send back to the sender
    pub reply: Option<ControlFrame>,
    /// Final path of a fully received file, ready for the installer
    pub ready: Option<PathBuf>,
}

impl Step {
    fn reply(frame: ControlFrame) -> Self {
        Self {
            reply: Some(frame),
            ready: None,
        }
    }
}

pub(crate) struct InboundTransfer {
    id: Uuid,
    peer: IpAddr,
    file_name: String,
    file_size: u64,
    received: u64,
    last_reported: u64,
    target: Option<PathBuf>,
    partial: Option<PathBuf>,
    sink: Sink,
    status: TransferStatus,
}

impl InboundTransfer {
    /// Decide what to do with an announced file. The returned step may
    /// already carry the verdict (duplicate, bad name, empty file).
    pub fn start(
        download_dir: &Path,
        peer: IpAddr,
        file_name: &str,
        file_size: u64,
        manager: &TransferManager,
    ) -> (Self, Step) {
        let mut t = Self {
            id: Uuid::new_v4(),
            peer,
            file_name: file_name.to_string(),
            file_size,
            received: 0,
            last_reported: 0,
            target: None,
            partial: None,
            sink: Sink::Discard,
            status: TransferStatus::InProgress,
        };

        let target = match storage::resolve_target(download_dir, file_name) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer, "rejecting file: {:#}", e);
                let step = t.fail(format!("{:#}", e), manager);
                return (t, step);
            }
        };

        if storage::already_present(&target, file_size) {
            info!(peer = %peer, file = %file_name, "already present, discarding payload");
            t.set_status(TransferStatus::AlreadyPresent, manager);
            let step = Step::reply(ControlFrame::FileAck {
                file_name: t.file_name.clone(),
                status: AckStatus::ReceivedAlready,
            });
            return (t, step);
        }

        let partial = storage::partial_path(&target);
        let opened = storage::ensure_dir_exists(download_dir)
            .and_then(|_| File::create(&partial).map_err(anyhow::Error::from));
        match opened {
            Ok(f) => {
                info!(peer = %peer, file = %file_name, bytes = file_size, "receiving");
                t.sink = Sink::Write(BufWriter::with_capacity(CHUNK_SIZE, f));
                t.target = Some(target);
                t.partial = Some(partial);
                manager.report(t.update());
                let step = if file_size == 0 {
                    t.complete(manager)
                } else {
                    Step::default()
                };
                (t, step)
            }
            Err(e) => {
                let step = t.fail(format!("cannot create {}: {:#}", partial.display(), e), manager);
                (t, step)
            }
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[cfg(test)]
    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.received >= self.file_size
    }

    /// Payload bytes handed out by the decoder for this file
    pub fn write(&mut self, data: &[u8], manager: &TransferManager) -> Step {
        self.received += data.len() as u64;
        if let Sink::Write(w) = &mut self.sink {
            if let Err(e) = w.write_all(data) {
                return self.fail(format!("write failed: {}", e), manager);
            }
            if self.received - self.last_reported >= CHUNK_SIZE as u64 {
                self.last_reported = self.received;
                manager.report(self.update());
            }
        }
        if self.is_finished() {
            return self.complete(manager);
        }
        Step::default()
    }

    /// Stop writing; the rest of the declared bytes are still consumed
    pub fn cancel_locally(&mut self, manager: &TransferManager) -> Step {
        if self.status.is_terminal() {
            return Step::default();
        }
        info!(peer = %self.peer, file = %self.file_name, "cancelling incoming transfer");
        self.drop_partial();
        self.set_status(TransferStatus::Cancelled, manager);
        Step::reply(ControlFrame::CancelTransfer {
            file_name: self.file_name.clone(),
        })
    }

    /// The sender gave up on this file
    pub fn cancelled_by_peer(&mut self, manager: &TransferManager) {
        if self.status.is_terminal() {
            return;
        }
        info!(peer = %self.peer, file = %self.file_name, "sender cancelled transfer");
        self.drop_partial();
        self.set_status(TransferStatus::Cancelled, manager);
    }

    /// The session ended before the declared length arrived
    pub fn disconnected(mut self, manager: &TransferManager) {
        if self.status.is_terminal() {
            return;
        }
        warn!(
            peer = %self.peer,
            file = %self.file_name,
            received = self.received,
            expected = self.file_size,
            "session lost mid-transfer"
        );
        self.drop_partial();
        self.set_status(TransferStatus::Disconnected, manager);
    }

    fn complete(&mut self, manager: &TransferManager) -> Step {
        let sink = std::mem::replace(&mut self.sink, Sink::Discard);
        let Sink::Write(writer) = sink else {
            return Step::default();
        };
        let (Some(partial), Some(target)) = (self.partial.clone(), self.target.clone()) else {
            return Step::default();
        };
        let finished = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all())
            .and_then(|_| std::fs::rename(&partial, &target));
        match finished {
            Ok(()) => {
                info!(peer = %self.peer, file = %self.file_name, bytes = self.received, "received");
                self.partial = None;
                self.set_status(TransferStatus::Completed, manager);
                Step {
                    reply: Some(ControlFrame::FileAck {
                        file_name: self.file_name.clone(),
                        status: AckStatus::Received,
                    }),
                    ready: Some(target),
                }
            }
            Err(e) => self.fail(format!("cannot finalize {}: {}", target.display(), e), manager),
        }
    }

    fn fail(&mut self, reason: String, manager: &TransferManager) -> Step {
        self.sink = Sink::Discard;
        self.drop_partial();
        self.set_status(TransferStatus::Failed(reason.clone()), manager);
        Step::reply(ControlFrame::StatusUpdate {
            file_name: self.file_name.clone(),
            status: RemoteStatus::Failed,
            message: Some(reason),
        })
    }

    fn drop_partial(&mut self) {
        self.sink = Sink::Discard;
        if let Some(p) = self.partial.take() {
            storage::discard(&p);
        }
    }

    fn set_status(&mut self, status: TransferStatus, manager: &TransferManager) {
        if self.status.is_terminal() {
            debug!(file = %self.file_name, ignored = ?status, "late status ignored");
            return;
        }
        self.status = status;
        manager.report(self.update());
    }

    fn update(&self) -> TransferUpdate {
        TransferUpdate {
            job_id: self.id,
            peer: self.peer,
            direction: Direction::Inbound,
            file_name: self.file_name.clone(),
            status: self.status.clone(),
            bytes: self.received,
            total: self.file_size,
            percent: percent(self.received, self.file_size),
        }
    }
}
