//! Client-side reconnection with exponential backoff

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::events::{Event, EventSink};
use crate::token::CancelToken;

/// Delays between attempts: `initial`, doubling, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = (self.next * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// At most one retry loop per server address
pub struct ReconnectSupervisor {
    active: Arc<Mutex<HashSet<SocketAddr>>>,
    initial: Duration,
    max: Duration,
    poll: Duration,
    events: EventSink,
    token: CancelToken,
}

impl ReconnectSupervisor {
    pub fn new(
        initial: Duration,
        max: Duration,
        poll: Duration,
        events: EventSink,
        token: CancelToken,
    ) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            initial,
            max,
            poll,
            events,
            token,
        }
    }

    pub fn is_active(&self, addr: SocketAddr) -> bool {
        self.active.lock().contains(&addr)
    }

    /// Start a loop that calls `attempt` now and then after each backoff
    /// delay until it returns true or the supervisor is stopped. Returns
    /// false if a loop for `addr` is already running.
    pub fn schedule<F>(&self, addr: SocketAddr, attempt: F) -> bool
    where
        F: Fn() -> bool + Send + 'static,
    {
        if !self.active.lock().insert(addr) {
            debug!(addr = %addr, "reconnect already in progress");
            return false;
        }
        let active = self.active.clone();
        let events = self.events.clone();
        let token = self.token.clone();
        let mut backoff = Backoff::new(self.initial, self.max);
        let poll = self.poll;

        let spawned = std::thread::Builder::new()
            .name(format!("lanpush-reconnect-{}", addr))
            .spawn(move || {
                let mut n = 0u32;
                while !token.is_cancelled() {
                    n += 1;
                    if attempt() {
                        if n > 1 {
                            info!(addr = %addr, attempts = n, "reconnected");
                        }
                        break;
                    }
                    let delay = backoff.next_delay();
                    info!(addr = %addr, attempt = n, "connect failed, retrying in {:?}", delay);
                    events.emit(Event::Reconnecting {
                        addr,
                        attempt: n,
                        delay,
                    });
                    if !token.sleep(delay, poll) {
                        break;
                    }
                }
                active.lock().remove(&addr);
            });
        if spawned.is_err() {
            self.active.lock().remove(&addr);
            return false;
        }
        true
    }
}
