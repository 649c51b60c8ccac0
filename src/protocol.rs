//! Shared protocol constants for the lanpush discovery and session transport

// Well-known ports (UDP discovery, TCP session)
pub const DISCOVERY_PORT: u16 = 5000;
pub const SESSION_PORT: u16 = 5001;

// File payload is streamed in chunks of this size; cancellation and progress
// are evaluated at chunk boundaries
pub const CHUNK_SIZE: usize = 64 * 1024;

// Longest control line accepted before the decoder gives up on it
pub const MAX_LINE_LEN: usize = 64 * 1024;

// Largest discovery datagram we send or accept
pub const MAX_DATAGRAM: usize = 2048;

// Literal probe understood by advertisers alongside the JSON request
pub const DISCOVERY_PROBE: &[u8] = b"LANPUSH_DISCOVER";

// Suffix for files still being received
pub const PARTIAL_SUFFIX: &str = ".part";

// Transfer history file written into the download directory
pub const JOURNAL_FILE: &str = ".lanpush_transfers.jsonl";

// Wire type tags (the `type` field of every JSON message)
pub mod tag {
    pub const CLIENT_INFO: &str = "CLIENT_INFO";
    pub const FILE_METADATA: &str = "FILE_METADATA";
    pub const FILE_ACK: &str = "FILE_ACK";
    pub const STATUS_UPDATE: &str = "STATUS_UPDATE";
    pub const CANCEL_TRANSFER: &str = "CANCEL_TRANSFER";
    pub const HEARTBEAT: &str = "HEARTBEAT";

    // Discovery datagrams
    pub const DISCOVERY_REQUEST: &str = "DISCOVERY_REQUEST";
    pub const SERVER_ADVERTISEMENT: &str = "SERVER_ADVERTISEMENT";
}

// Centralized timeout constants; Config overrides most of them
pub mod timeouts {
    // TCP connect (ms)
    pub const CONNECT_MS: u64 = 30_000;

    // Post-connect idle/write limit (ms)
    pub const IO_MS: u64 = 120_000;

    // Blocking socket calls wake at least this often to check for shutdown (ms)
    pub const POLL_MS: u64 = 500;

    // Keep NAT/firewall state alive (ms)
    pub const HEARTBEAT_MS: u64 = 10_000;

    // Discovery probe period (ms)
    pub const DISCOVERY_INTERVAL_MS: u64 = 3_000;

    // A peer not seen for this long is dropped from the peer table (ms)
    pub const PEER_TTL_MS: u64 = 30_000;

    // Reconnect backoff: start, doubling up to the cap (ms)
    pub const RECONNECT_INITIAL_MS: u64 = 3_000;
    pub const RECONNECT_MAX_MS: u64 = 30_000;
}

/// Progress as a percentage, clamped to 0..=100. An empty file is complete
/// as soon as it starts.
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

/// `os_type` value this node advertises
pub fn os_family() -> &'static str {
    std::env::consts::OS
}

pub fn is_windows() -> bool {
    cfg!(windows)
}
