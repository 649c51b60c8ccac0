//! Everything the core reports, as plain data on a channel
//!
//! Callers poll or block on the `Receiver<Event>` returned when a node starts.
//! Sending never blocks and a dropped receiver is ignored.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

use crate::discovery::PeerRecord;
use crate::message::{PeerIdentity, RemoteStatus};
use crate::session::CloseReason;
use crate::transfer::{Direction, TransferStatus};

#[derive(Debug, Clone)]
pub struct TransferUpdate {
    pub job_id: Uuid,
    pub peer: IpAddr,
    pub direction: Direction,
    pub file_name: String,
    pub status: TransferStatus,
    pub bytes: u64,
    pub total: u64,
    pub percent: f64,
}

impl TransferUpdate {
    /// Human-readable state as shown to the operator
    pub fn describe(&self) -> String {
        self.status.describe(self.direction)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    PeerDiscovered(PeerRecord),
    PeerExpired(IpAddr),
    /// Discovery could not start; sessions keep working
    DiscoveryUnavailable(String),
    SessionOpened {
        peer: IpAddr,
        identity: PeerIdentity,
    },
    SessionClosed {
        peer: IpAddr,
        reason: CloseReason,
    },
    Transfer(TransferUpdate),
    /// Outcome the other side reported for a file we sent (installer result)
    RemoteStatus {
        peer: IpAddr,
        file_name: String,
        status: RemoteStatus,
        message: Option<String>,
    },
    Reconnecting {
        addr: SocketAddr,
        attempt: u32,
        delay: Duration,
    },
    ProtocolViolation {
        peer: IpAddr,
        detail: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

pub fn channel() -> (EventSink, Receiver<Event>) {
    let (tx, rx) = unbounded();
    (EventSink { tx }, rx)
}
