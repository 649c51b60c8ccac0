//! Node configuration, loaded from TOML with CLI overrides applied on top

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{self, timeouts};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Advertised hostname; the OS hostname when unset
    pub hostname: Option<String>,

    pub bind_ip: IpAddr,
    pub discovery_port: u16, // 0 = ephemeral (tests)
    pub session_port: u16,   // 0 = ephemeral (tests)
    /// Source address for outgoing connections
    pub local_ip: Option<IpAddr>,
    /// Address put in advertisements instead of the auto-detected one
    pub advertise_ip: Option<IpAddr>,

    pub discovery_enabled: bool,
    pub discovery_interval_ms: u64,
    pub peer_ttl_ms: u64,
    /// Extra unicast probe targets on top of the broadcast addresses
    pub discovery_targets: Vec<SocketAddr>,
    /// Accept advertisements from loopback and from this host itself
    pub allow_loopback: bool,
    /// Connect to every discovered server
    pub auto_connect: bool,

    pub chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub poll_ms: u64,
    pub heartbeat_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,

    pub download_dir: PathBuf,
    /// Append terminal transfer states to the JSONL history file
    pub journal: bool,
    /// argv for the installer run on every received file; `{file}` is
    /// replaced by the received path
    pub install_command: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: protocol::DISCOVERY_PORT,
            session_port: protocol::SESSION_PORT,
            local_ip: None,
            advertise_ip: None,
            discovery_enabled: true,
            discovery_interval_ms: timeouts::DISCOVERY_INTERVAL_MS,
            peer_ttl_ms: timeouts::PEER_TTL_MS,
            discovery_targets: Vec::new(),
            allow_loopback: false,
            auto_connect: true,
            chunk_size: protocol::CHUNK_SIZE,
            connect_timeout_ms: timeouts::CONNECT_MS,
            io_timeout_ms: timeouts::IO_MS,
            poll_ms: timeouts::POLL_MS,
            heartbeat_ms: timeouts::HEARTBEAT_MS,
            reconnect_initial_ms: timeouts::RECONNECT_INITIAL_MS,
            reconnect_max_ms: timeouts::RECONNECT_MAX_MS,
            download_dir: PathBuf::from("downloads"),
            journal: true,
            install_command: None,
        }
    }
}

impl Config {
    /// Parse a TOML file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Explicit path must exist; otherwise the default path is tried and
    /// defaults are used when it is absent
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load(p);
        }
        let p = default_path();
        if p.exists() {
            Self::load(&p)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create config directory {}", dir.display()))?;
        let data = toml::to_string(self)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.chunk_size > protocol::MAX_LINE_LEN * 64 {
            bail!("chunk_size {} is unreasonably large", self.chunk_size);
        }
        for (name, v) in [
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("peer_ttl_ms", self.peer_ttl_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("io_timeout_ms", self.io_timeout_ms),
            ("poll_ms", self.poll_ms),
            ("heartbeat_ms", self.heartbeat_ms),
            ("reconnect_initial_ms", self.reconnect_initial_ms),
        ] {
            if v == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            bail!("reconnect_max_ms must not be below reconnect_initial_ms");
        }
        if matches!(&self.install_command, Some(argv) if argv.is_empty()) {
            bail!("install_command must name a program");
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        if let Some(h) = &self.hostname {
            return h.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("LanPush");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("lanpush");
    }
    PathBuf::from(".lanpush")
}

pub fn default_path() -> PathBuf {
    config_dir().join("lanpush.toml")
}
