//! lanpush library
//!
//! LAN software distribution: servers advertise over UDP broadcast, agents
//! connect over TCP, and files are pushed over a session that interleaves
//! newline-delimited JSON control frames with declared-length raw payload.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
mod inbound;
pub mod install;
pub mod journal;
pub mod message;
pub mod net;
mod node;
pub mod progress;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod storage;
pub mod token;
pub mod transfer;
pub mod transform;

pub use client::Client;
pub use config::Config;
pub use events::{Event, TransferUpdate};
pub use node::NodeOptions;
pub use server::Server;
pub use session::CloseReason;
pub use transfer::{CancelOutcome, TransferStatus};
