//! Control frame vocabulary exchanged over a session
//!
//! Every frame is one JSON object whose `type` field selects the variant.
//! Frames are decoded once in the codec; everything downstream matches on
//! [`ControlFrame`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::install::InstallOutcome;

/// Who is on the other end of a session. Sent once, as the first frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub hostname: String,
    pub os_type: String,
    #[serde(default)]
    pub is_windows: bool,
    #[serde(default)]
    pub ip: String,
}

impl PeerIdentity {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            os_type: crate::protocol::os_family().to_string(),
            is_windows: crate::protocol::is_windows(),
            ip: ip.into(),
        }
    }
}

/// Receiver verdict once a declared payload has been consumed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    #[serde(alias = "Received")]
    Received,
    /// Same name and size already present; the payload was not written
    #[serde(alias = "Received Already", alias = "ReceivedAlready")]
    ReceivedAlready,
}

/// Outcome reported back to the sending side after a transfer ended
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Installed,
    ManualSetupRequired,
    Unsupported,
    Cancelled,
    Disconnected,
    Failed,
}

impl From<InstallOutcome> for RemoteStatus {
    fn from(outcome: InstallOutcome) -> Self {
        match outcome {
            InstallOutcome::Installed => Self::Installed,
            InstallOutcome::ManualSetupRequired => Self::ManualSetupRequired,
            InstallOutcome::Unsupported => Self::Unsupported,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installed => "installed",
            Self::ManualSetupRequired => "manual setup required",
            Self::Unsupported => "unsupported installer",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "not received (disconnected)",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "CLIENT_INFO")]
    Identity(PeerIdentity),
    /// Announces exactly `file_size` raw bytes that follow on the stream
    #[serde(rename = "FILE_METADATA")]
    FileMetadata { file_name: String, file_size: u64 },
    #[serde(rename = "FILE_ACK")]
    FileAck { file_name: String, status: AckStatus },
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate {
        file_name: String,
        status: RemoteStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "CANCEL_TRANSFER")]
    CancelTransfer { file_name: String },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

impl ControlFrame {
    pub fn kind(&self) -> &'static str {
        use crate::protocol::tag;
        match self {
            Self::Identity(_) => tag::CLIENT_INFO,
            Self::FileMetadata { .. } => tag::FILE_METADATA,
            Self::FileAck { .. } => tag::FILE_ACK,
            Self::StatusUpdate { .. } => tag::STATUS_UPDATE,
            Self::CancelTransfer { .. } => tag::CANCEL_TRANSFER,
            Self::Heartbeat => tag::HEARTBEAT,
        }
    }
}
