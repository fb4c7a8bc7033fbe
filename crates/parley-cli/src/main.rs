//! Parley: line-oriented peer-to-peer encrypted messenger.

#![forbid(unsafe_code)]

mod commands;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parley_common::file_transfer::{read_file_payload, save_received_file};
use parley_common::helpers::env_bool;
use parley_common::{Envelope, Inbound};
use parley_peer::config::DEFAULT_PORT;
use parley_peer::{Coordinator, EventSubscription, PeerAddress, PeerConfig, PeerEvent, CONNECTION_LOST};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::commands::{Command, HELP};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Parley - encrypted peer-to-peer messaging")]
struct Args {
    /// Name other peers know you by
    #[arg(long, env = "PARLEY_USERNAME")]
    username: String,

    /// TCP port to listen on (1024-65535)
    #[arg(long, env = "PARLEY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to advertise to peers (discovered when unset)
    #[arg(long, env = "PARLEY_ADVERTISE_HOST")]
    advertise_host: Option<IpAddr>,

    /// Where received files are saved
    #[arg(long, env = "PARLEY_DOWNLOAD_DIR", default_value = "downloads")]
    download_dir: PathBuf,

    /// Do not reconnect to peers whose connection was lost (also PARLEY_AUTO_RECONNECT=0)
    #[arg(long, default_value_t = false)]
    no_auto_reconnect: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    parley_common::init_tracing_with_default(&args.log_level);

    let auto_reconnect = auto_reconnect_enabled(&args);
    let mut config = PeerConfig::new(args.username.clone(), args.port);
    config.advertise_host = args.advertise_host;

    info!("starting parley v{}", env!("CARGO_PKG_VERSION"));
    let peer = Coordinator::start(config)
        .await
        .context("failed to start peer")?;

    println!(
        "{} listening at {} (key {})",
        peer.username(),
        peer.advertised_addr(),
        short_fingerprint(peer.fingerprint())
    );
    println!("type /help for commands");

    let printer = tokio::spawn(print_events(
        peer.clone(),
        peer.subscribe(),
        Arc::new(args.download_dir),
        auto_reconnect,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => run_command(&peer, command),
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    peer.shutdown().await;
    printer.abort();
    Ok(())
}

/// Runs one command. Network work goes on its own task so the prompt stays live.
fn run_command(peer: &Coordinator, command: Command) {
    match command {
        Command::Connect {
            host,
            port,
            username,
        } => {
            let peer = peer.clone();
            tokio::spawn(async move {
                println!("* connecting to {username} at {host}:{port}...");
                if let Err(e) = peer.connect(&host, port, &username).await {
                    println!("! could not connect to {username}: {e}");
                }
            });
        }
        Command::Accept(username) => {
            if let Err(e) = peer.accept_incoming(&username) {
                println!("! {e}");
            }
        }
        Command::Refuse(username) => match peer.refuse_incoming(&username) {
            Ok(()) => println!("* refused {username}"),
            Err(e) => println!("! {e}"),
        },
        Command::Send { username, text } => {
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send(&username, &text).await {
                    debug!("send to {} failed: {}", username, e);
                    println!("! message to {username} not sent: {e}");
                }
            });
        }
        Command::File { username, path } => {
            let peer = peer.clone();
            tokio::spawn(async move {
                let (filename, bytes) = match read_file_payload(&path) {
                    Ok(payload) => payload,
                    Err(e) => {
                        println!("! {e:#}");
                        return;
                    }
                };
                match peer.send_file(&username, &filename, &bytes).await {
                    Ok(()) => println!("* sent {filename} ({} bytes) to {username}", bytes.len()),
                    Err(e) => println!("! {filename} not sent to {username}: {e}"),
                }
            });
        }
        Command::Disconnect(username) => {
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.disconnect(&username).await {
                    println!("! {e}");
                }
            });
        }
        Command::Peers => {
            let peers = peer.peers();
            let pending = peer.pending_requests();
            if peers.is_empty() {
                println!("no peers");
            }
            for record in peers {
                let marker = if pending.contains(&record.username) {
                    " (awaiting /accept)"
                } else {
                    ""
                };
                println!(
                    "  {} {} {}{}",
                    record.username, record.address, record.state, marker
                );
            }
        }
        Command::Key => {
            println!("fingerprint: {}", peer.fingerprint());
            println!("{}", peer.public_key_pem().trim_end());
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

async fn print_events(
    peer: Coordinator,
    mut events: EventSubscription,
    download_dir: Arc<PathBuf>,
    auto_reconnect: bool,
) {
    let mut addresses: HashMap<String, PeerAddress> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::MessageReceived(Inbound::Envelope(Envelope::Message { username, content })) => {
                println!("[{username}] {content}");
            }
            PeerEvent::MessageReceived(Inbound::Envelope(Envelope::File {
                username,
                filename,
                content,
            })) => {
                let from = username.unwrap_or_else(|| "unknown".into());
                let dir = download_dir.clone();
                let saved =
                    tokio::task::spawn_blocking(move || save_received_file(&dir, &filename, &content))
                        .await;
                match saved {
                    Ok(Ok(path)) => println!("* {from} sent a file, saved to {}", path.display()),
                    Ok(Err(e)) => warn!("could not save file from {}: {:#}", from, e),
                    Err(e) => warn!("file save task failed: {}", e),
                }
            }
            PeerEvent::MessageReceived(Inbound::Text(text)) => println!("[?] {text}"),
            PeerEvent::MessageReceived(Inbound::Envelope(other)) => {
                debug!("ignoring delivered {}", other.kind());
            }
            PeerEvent::SendOutcome {
                username,
                success: false,
                error,
            } => {
                debug!(
                    "delivery to {} failed: {}",
                    username,
                    error.unwrap_or_default()
                );
            }
            PeerEvent::SendOutcome { .. } => {}
            PeerEvent::KeyExchangeComplete { username } => {
                if let Some(record) = peer.peers().into_iter().find(|r| r.username == username) {
                    addresses.insert(username.clone(), record.address);
                }
                println!("* connected to {username}, messages are encrypted");
            }
            PeerEvent::IncomingConnectionRequest {
                username,
                host,
                port,
            } => {
                println!(
                    "* {username} ({host}:{port}) wants to connect: /accept {username} or /refuse {username}"
                );
            }
            PeerEvent::ConnectionStatusChanged {
                username,
                connected: false,
                detail,
            } => {
                let detail = detail.unwrap_or_else(|| "disconnected".into());
                println!("* {username}: {detail}");

                if auto_reconnect && detail == CONNECTION_LOST {
                    if let Some(address) = addresses.get(&username).cloned() {
                        schedule_reconnect(peer.clone(), username, address);
                    }
                }
            }
            PeerEvent::ConnectionStatusChanged { .. } => {}
        }
    }
}

fn schedule_reconnect(peer: Coordinator, username: String, address: PeerAddress) {
    info!(
        "reconnecting to {} at {} in {:?}",
        username, address, RECONNECT_DELAY
    );
    tokio::spawn(async move {
        tokio::time::sleep(RECONNECT_DELAY).await;
        if peer.is_shut_down() {
            return;
        }
        match peer.connect(&address.host, address.port, &username).await {
            Ok(()) => info!("reconnected to {}", username),
            Err(e) => println!("! reconnect to {username} failed: {e}"),
        }
    });
}

/// On unless `--no-auto-reconnect` or `PARLEY_AUTO_RECONNECT=0`.
fn auto_reconnect_enabled(args: &Args) -> bool {
    !args.no_auto_reconnect && env_bool("PARLEY_AUTO_RECONNECT", true)
}

fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reconnect_defaults_on() {
        let args = Args::try_parse_from(["parley", "--username", "alice"]).unwrap();
        assert!(!args.no_auto_reconnect);
        if std::env::var_os("PARLEY_AUTO_RECONNECT").is_none() {
            assert!(auto_reconnect_enabled(&args));
        }

        let args =
            Args::try_parse_from(["parley", "--username", "alice", "--no-auto-reconnect"]).unwrap();
        assert!(!auto_reconnect_enabled(&args));
    }

    #[test]
    fn short_fingerprint_truncates() {
        assert_eq!(short_fingerprint("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(short_fingerprint("abc"), "abc");
    }
}
