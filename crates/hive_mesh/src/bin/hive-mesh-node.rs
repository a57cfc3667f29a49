//! A minimal mesh node: lines typed on stdin are broadcast to every peer and
//! messages from peers are printed.
//!
//! ```text
//! hive-mesh-node [config.json] [--log-dir DIR]
//! ```
//!
//! A missing config file falls back to defaults and is written out so it
//! can be edited.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hive_mesh::logging;
use hive_mesh::{Mesh, MeshEvent, MeshOptions, MessageRegistry};

const LISTEN_BACKLOG: u32 = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chat {
    text: String,
}

struct Args {
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        log_dir: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--log-dir" => {
                args.log_dir = Some(iter.next().context("--log-dir needs a directory")?.into());
            }
            _ if args.config.is_none() => args.config = Some(arg.into()),
            other => anyhow::bail!("unexpected argument {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let _log_guard = match &args.log_dir {
        Some(dir) => Some(logging::init_logging_to_dir(dir, logging::DEFAULT_FILTER)?),
        None => {
            logging::init_logging(logging::DEFAULT_FILTER);
            None
        }
    };

    let options = match &args.config {
        Some(path) => {
            let options = MeshOptions::load_or_default(path);
            if !path.exists() {
                options.save_to_file(path)?;
                info!("Wrote default config to {}", path.display());
            }
            options
        }
        None => MeshOptions::default(),
    };

    let mut registry = MessageRegistry::new();
    registry.register::<Chat>("chat")?;

    let mesh = Mesh::new(options, registry)?;
    mesh.start(LISTEN_BACKLOG).await?;
    println!(
        "node {} listening on {}",
        mesh.local_token(),
        mesh.local_endpoint().context("listener not bound")?
    );

    let cancel = CancellationToken::new();

    let mut events = mesh.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                MeshEvent::PeerConnected(peer) => println!("+ {peer}"),
                MeshEvent::PeerRemoved(peer) => println!("- {peer}"),
                MeshEvent::DialFailed { addr, attempt, reason } => {
                    println!("! {addr} attempt {attempt}: {reason}")
                }
                MeshEvent::AddressAbandoned { addr } => println!("! gave up on {addr}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            envelope = mesh.wait(&cancel) => match envelope {
                Ok(envelope) => {
                    if let Some(chat) = envelope.payload.downcast_ref::<Chat>() {
                        println!("[{}] {}", envelope.source, chat.text);
                    }
                }
                Err(e) => {
                    warn!("Inbox closed: {e}");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    let status = mesh.broadcast(Chat { text }, &cancel).await?;
                    println!("sent to {} peer(s)", status.reached.len());
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    cancel.cancel();
    mesh.stop().await;
    printer.abort();
    Ok(())
}
