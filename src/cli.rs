//! Shared CLI helpers and small reusable Clap fragments

use anyhow::{Context, Result};
use clap::{Args, Parser};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;

/// Options every node accepts; flags override the config file
#[derive(Clone, Debug, Args)]
pub struct NodeArgs {
    /// Config file (TOML). Defaults to the per-user config when it exists
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Name advertised to peers
    #[arg(long)]
    pub hostname: Option<String>,

    /// Local address to bind
    #[arg(long)]
    pub bind: Option<IpAddr>,

    #[arg(long)]
    pub discovery_port: Option<u16>,

    #[arg(long)]
    pub session_port: Option<u16>,

    /// Where received files are written
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Do not advertise or probe over UDP
    #[arg(long)]
    pub no_discovery: bool,

    /// Accept advertisements from this host (same-machine testing)
    #[arg(long)]
    pub allow_loopback: bool,

    /// Extra unicast discovery target (host:port), repeatable
    #[arg(long = "probe")]
    pub probe: Vec<SocketAddr>,

    /// Do not append to the transfer journal
    #[arg(long)]
    pub no_journal: bool,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,
}

impl NodeArgs {
    pub fn load_config(&self) -> Result<Config> {
        let mut cfg = Config::load_or_default(self.config.as_deref())?;
        if let Some(h) = &self.hostname {
            cfg.hostname = Some(h.clone());
        }
        if let Some(ip) = self.bind {
            cfg.bind_ip = ip;
        }
        if let Some(p) = self.discovery_port {
            cfg.discovery_port = p;
        }
        if let Some(p) = self.session_port {
            cfg.session_port = p;
        }
        if let Some(d) = &self.download_dir {
            cfg.download_dir = d.clone();
        }
        if self.no_discovery {
            cfg.discovery_enabled = false;
        }
        if self.allow_loopback {
            cfg.allow_loopback = true;
        }
        cfg.discovery_targets.extend(self.probe.iter().copied());
        if self.no_journal {
            cfg.journal = false;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "lanpush=debug"
        } else {
            "lanpush=info"
        }
    }
}

/// Options for the admin daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "lanpush admin daemon: advertise, accept agents, push files")]
pub struct ServerOpts {
    #[command(flatten)]
    pub node: NodeArgs,

    /// File pushed to every agent as soon as it connects, repeatable
    #[arg(long = "push")]
    pub push: Vec<PathBuf>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    pub save_config: Option<PathBuf>,
}

/// Options for the long-running agent
#[derive(Clone, Debug, Args)]
pub struct AgentOpts {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Server to connect to without waiting for discovery, repeatable
    #[arg(long)]
    pub connect: Vec<SocketAddr>,

    /// Only list discovered servers, do not connect to them
    #[arg(long)]
    pub no_auto_connect: bool,
}

#[derive(Clone, Debug, Args)]
pub struct DiscoverOpts {
    #[command(flatten)]
    pub node: NodeArgs,

    /// How long to listen for advertisements
    #[arg(long, default_value_t = 5)]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct SendOpts {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Server session address (host:port)
    pub server: SocketAddr,

    /// Files to send
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Install the tracing subscriber; `RUST_LOG` takes precedence over `default`
pub fn init_tracing(default: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Flag raised by Ctrl-C
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let f = flag.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, shutting down...");
        f.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let opts = ServerOpts::try_parse_from([
            "lanpushd",
            "--hostname",
            "SRV1",
            "--session-port",
            "6001",
            "--no-discovery",
            "--probe",
            "10.0.0.9:5000",
            "--push",
            "setup.exe",
        ])
        .unwrap();
        let cfg = opts.node.load_config().unwrap();
        assert_eq!(cfg.hostname(), "SRV1");
        assert_eq!(cfg.session_port, 6001);
        assert!(!cfg.discovery_enabled);
        assert!(cfg
            .discovery_targets
            .contains(&"10.0.0.9:5000".parse().unwrap()));
        assert_eq!(opts.push, vec![PathBuf::from("setup.exe")]);
    }
}
