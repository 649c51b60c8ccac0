//! Terminal rendering of node events
//!
//! One progress bar per transfer; everything else prints as a line above the
//! bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;

use crate::events::{Event, TransferUpdate};
use crate::transfer::{Direction, TransferStatus};

pub struct EventRenderer {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
    style: ProgressStyle,
}

impl Default for EventRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRenderer {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix:>10} {msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            style,
        }
    }

    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::Transfer(update) => self.transfer(update),
            other => {
                if let Some(line) = describe(other) {
                    let _ = self.multi.println(line);
                }
            }
        }
    }

    fn transfer(&mut self, u: &TransferUpdate) {
        if u.status == TransferStatus::Queued {
            let _ = self.multi.println(format!("queued    {} -> {}", u.file_name, u.peer));
            return;
        }
        let bar = self.bars.entry(u.job_id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(u.total));
            bar.set_style(self.style.clone());
            bar.set_prefix(match u.direction {
                Direction::Outbound => "sending",
                Direction::Inbound => "receiving",
            });
            bar.set_message(format!("{} ({})", u.file_name, u.peer));
            bar
        });
        bar.set_position(u.bytes);
        if u.status.is_terminal() {
            bar.finish_with_message(format!("{} ({}): {}", u.file_name, u.peer, u.describe()));
            self.bars.remove(&u.job_id);
        }
    }
}

/// One-line description of a non-transfer event
pub fn describe(event: &Event) -> Option<String> {
    let line = match event {
        Event::PeerDiscovered(p) => format!(
            "found     {} ({}, {}) port {}",
            p.hostname, p.address, p.os_family, p.port
        ),
        Event::PeerExpired(ip) => format!("lost      {}", ip),
        Event::DiscoveryUnavailable(e) => format!("discovery unavailable: {}", e),
        Event::SessionOpened { peer, identity } => {
            format!("connected {} ({}, {})", peer, identity.hostname, identity.os_type)
        }
        Event::SessionClosed { peer, reason } => format!("closed    {}: {}", peer, reason),
        Event::RemoteStatus {
            peer,
            file_name,
            status,
            message,
        } => match message {
            Some(m) => format!("{} on {}: {} ({})", file_name, peer, status, m),
            None => format!("{} on {}: {}", file_name, peer, status),
        },
        Event::Reconnecting {
            addr,
            attempt,
            delay,
        } => format!("retrying  {} in {:?} (attempt {})", addr, delay, attempt),
        Event::ProtocolViolation { peer, detail } => format!("protocol  {}: {}", peer, detail),
        Event::Transfer(_) => return None,
    };
    Some(line)
}
