//! lanpush agent
//!
//! `agent` finds servers on the LAN, stays connected and installs what they
//! push. `discover` lists servers once. `send` pushes files to one server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

use lanpush::cli::{self, AgentOpts, DiscoverOpts, SendOpts};
use lanpush::progress::EventRenderer;
use lanpush::transfer::TransferStatus;
use lanpush::{discovery, Client, Event, NodeOptions};

const TICK: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "lanpush agent: receive and install software pushed over the LAN")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover servers, stay connected and install received files
    Agent(AgentOpts),
    /// List servers answering on the LAN and exit
    Discover(DiscoverOpts),
    /// Send files to a server
    Send(SendOpts),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Agent(opts) => agent(opts),
        Command::Discover(opts) => discover(opts),
        Command::Send(opts) => send(opts),
    }
}

fn agent(opts: AgentOpts) -> Result<()> {
    cli::init_tracing(opts.node.log_filter());
    let mut cfg = opts.node.load_config()?;
    if opts.no_auto_connect {
        cfg.auto_connect = false;
    }
    let stop = cli::interrupt_flag()?;
    let (client, events) = Client::start(cfg, NodeOptions::default())?;
    for addr in &opts.connect {
        client.connect_with_retry(*addr);
    }

    let mut renderer = EventRenderer::new();
    while !stop.load(Ordering::SeqCst) {
        match events.recv_timeout(TICK) {
            Ok(ev) => renderer.handle(&ev),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    client.stop();
    Ok(())
}

fn discover(opts: DiscoverOpts) -> Result<()> {
    cli::init_tracing(opts.node.log_filter());
    let cfg = opts.node.load_config()?;
    let peers = discovery::discover(&cfg, Duration::from_secs(opts.timeout_secs))?;
    if peers.is_empty() {
        println!("no servers found");
        return Ok(());
    }
    for p in peers {
        println!(
            "{:<16} {:<24} {:<8} port {}",
            p.address, p.hostname, p.os_family, p.port
        );
    }
    Ok(())
}

fn send(opts: SendOpts) -> Result<()> {
    cli::init_tracing(opts.node.log_filter());
    let mut cfg = opts.node.load_config()?;
    cfg.discovery_enabled = false;
    cfg.auto_connect = false;
    let stop = cli::interrupt_flag()?;

    let (client, events) = Client::start(cfg, NodeOptions::default())?;
    let session = client
        .connect(opts.server)
        .with_context(|| format!("connect to {}", opts.server))?;

    let mut outcome: HashMap<Uuid, Option<TransferStatus>> = HashMap::new();
    for file in &opts.files {
        let id = client
            .send(session.peer, file)
            .with_context(|| format!("queue {}", file.display()))?;
        outcome.insert(id, None);
    }

    let mut renderer = EventRenderer::new();
    while outcome.values().any(Option::is_none) && !stop.load(Ordering::SeqCst) {
        match events.recv_timeout(TICK) {
            Ok(ev) => {
                renderer.handle(&ev);
                if let Event::Transfer(u) = &ev {
                    if u.status.is_terminal() {
                        if let Some(slot) = outcome.get_mut(&u.job_id) {
                            *slot = Some(u.status.clone());
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    client.stop();

    let failed = outcome
        .values()
        .filter(|s| {
            !matches!(
                s,
                Some(TransferStatus::Completed) | Some(TransferStatus::AlreadyPresent)
            )
        })
        .count();
    if failed > 0 {
        bail!("{} of {} files were not delivered", failed, outcome.len());
    }
    Ok(())
}
