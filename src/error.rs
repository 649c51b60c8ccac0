use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failures turning bytes into control frames or back
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },
    #[error("sealed frame rejected: {0}")]
    Sealed(String),
}

/// Failures enqueueing a file for a peer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unusable file name: {0}")]
    InvalidName(String),
}

/// Failures bringing a session up
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("already connected to {0}")]
    Duplicate(IpAddr),
    #[error("node is stopping")]
    Stopped,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
