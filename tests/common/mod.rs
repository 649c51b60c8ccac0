#![allow(dead_code)]

use crossbeam_channel::Receiver;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lanpush::codec::FrameCodec;
use lanpush::message::{ControlFrame, PeerIdentity};
use lanpush::{Config, Event};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WAIT: Duration = Duration::from_secs(20);

/// Loopback node with ephemeral ports and short timers
pub fn test_config(root: &Path, host: &str) -> Config {
    let mut cfg = Config::default();
    cfg.hostname = Some(host.to_string());
    cfg.bind_ip = LOCALHOST;
    cfg.session_port = 0;
    cfg.discovery_port = 0;
    cfg.discovery_enabled = false;
    cfg.allow_loopback = true;
    cfg.discovery_interval_ms = 100;
    cfg.peer_ttl_ms = 5_000;
    cfg.poll_ms = 20;
    cfg.heartbeat_ms = 500;
    cfg.connect_timeout_ms = 2_000;
    cfg.io_timeout_ms = 10_000;
    cfg.reconnect_initial_ms = 50;
    cfg.reconnect_max_ms = 200;
    cfg.download_dir = root.join(host).join("downloads");
    cfg
}

pub fn write_file(path: &Path, size: usize) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut f = std::fs::File::create(path).unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n]).unwrap();
        remaining -= n;
    }
    path.to_path_buf()
}

/// Block until `pick` accepts an event; panics after `WAIT`
pub fn wait_for<T>(rx: &Receiver<Event>, mut pick: impl FnMut(&Event) -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(ev) => {
                if let Some(v) = pick(&ev) {
                    return v;
                }
            }
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Every event until `done` accepts one (inclusive)
pub fn collect_until(rx: &Receiver<Event>, mut done: impl FnMut(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    wait_for(rx, |ev| {
        seen.push(ev.clone());
        done(ev).then_some(())
    });
    seen
}

/// Everything that arrives within `window`
pub fn drain_for(rx: &Receiver<Event>, window: Duration) -> Vec<Event> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(ev) => seen.push(ev),
            Err(_) => break,
        }
    }
    seen
}

pub fn session_opened(ev: &Event) -> Option<IpAddr> {
    match ev {
        Event::SessionOpened { peer, .. } => Some(*peer),
        _ => None,
    }
}

/// A hand-driven peer speaking the wire protocol over a raw socket
pub struct RawPeer {
    codec: FrameCodec,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RawPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        Self::wrap(stream)
    }

    pub fn wrap(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            codec: FrameCodec::new(None),
            reader: BufReader::new(stream),
            writer,
        }
    }

    pub fn send(&mut self, frame: &ControlFrame) {
        let bytes = self.codec.encode(frame).unwrap();
        self.writer.write_all(&bytes).unwrap();
    }

    pub fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).unwrap();
    }

    pub fn identify(&mut self, host: &str) {
        self.send(&ControlFrame::Identity(PeerIdentity::new(host, "127.0.0.1")));
    }

    /// Next control frame, skipping heartbeats
    pub fn next_frame(&mut self) -> ControlFrame {
        loop {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line).unwrap();
            assert!(n > 0, "peer closed the connection");
            let frame = self.codec.parse(line.trim_ascii_end()).unwrap();
            if frame != ControlFrame::Heartbeat {
                return frame;
            }
        }
    }

    /// Skip frames until `pick` accepts one
    pub fn expect(&mut self, mut pick: impl FnMut(&ControlFrame) -> bool) -> ControlFrame {
        loop {
            let frame = self.next_frame();
            if pick(&frame) {
                return frame;
            }
        }
    }

    pub fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).unwrap();
        data
    }
}
