use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lanpush::cli::{self, ServerOpts};
use lanpush::progress::EventRenderer;
use lanpush::{Event, NodeOptions, Server};

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    cli::init_tracing(opts.node.log_filter());
    let cfg = opts.node.load_config()?;

    if let Some(path) = &opts.save_config {
        cfg.save(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    for file in &opts.push {
        if !file.is_file() {
            anyhow::bail!("Error: not a file: {}", file.display());
        }
    }

    let stop = cli::interrupt_flag()?;
    let (server, events) = Server::start(cfg, NodeOptions::default())
        .context("Failed to start server")?;

    println!("Starting lanpush daemon:");
    println!("  Sessions:  {}", server.local_addr());
    match server.discovery_addr() {
        Some(addr) => println!("  Discovery: {}", addr),
        None => println!("  Discovery: off"),
    }
    for file in &opts.push {
        println!("  Push:      {}", file.display());
    }

    let mut renderer = EventRenderer::new();
    while !stop.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ev) => {
                renderer.handle(&ev);
                if let Event::SessionOpened { peer, .. } = &ev {
                    for file in &opts.push {
                        if let Err(e) = server.push(*peer, file) {
                            eprintln!("cannot push {} to {}: {}", file.display(), peer, e);
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    server.stop();
    Ok(())
}
