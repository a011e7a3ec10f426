//! Wardenctl CLI entry point.
//!
//! `watch` connects to a running daemon, registers one filter, and answers
//! every gated event with a fixed verdict.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::UnixStream;
use tracing::{info, warn};

use warden::broker::Filter;
use warden::daemon::frame::{read_frame, write_frame};
use warden::wire::{Verdict, MAX_MESSAGE_LEN};
use wardenctl::client::{Client, ClientEvent};

/// Wardenctl: talk to a Warden daemon.
#[derive(Parser)]
#[command(name = "wardenctl", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Register a filter and answer gated events.
    Watch {
        /// Daemon socket.
        #[arg(long, default_value = "/run/warden/warden.sock")]
        socket: PathBuf,
        /// Uid filter, 0 for any.
        #[arg(long, default_value_t = 0)]
        uid: u32,
        /// Rule filter, 0 for any.
        #[arg(long, default_value_t = 0)]
        rule: u32,
        /// Subsystem filter, 0 for any.
        #[arg(long, default_value_t = 0)]
        subsystem: u32,
        /// Verdict to answer with.
        #[arg(long, default_value_t = 0)]
        verdict: i32,
        /// Let other sessions overrule this verdict.
        #[arg(long)]
        delegate: bool,
        /// Exit after the first outcome.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    warden::logging::init_cli("info");

    match cli.command {
        Command::Watch {
            socket,
            uid,
            rule,
            subsystem,
            verdict,
            delegate,
            once,
        } => {
            let verdict = Verdict::new(verdict).context("verdict must not be negative")?;
            let filter = Filter::new(uid, rule, subsystem);
            watch(socket, filter, verdict, delegate, once).await
        }
    }
}

/// Connect, register `filter`, and answer every ask.
async fn watch(
    socket: PathBuf,
    filter: Filter,
    verdict: Verdict,
    delegate: bool,
    once: bool,
) -> anyhow::Result<()> {
    let stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    let (mut rd, mut wr) = stream.into_split();
    let mut client = Client::new();

    loop {
        let msg = tokio::select! {
            frame = read_frame(&mut rd, MAX_MESSAGE_LEN) => match frame? {
                Some(msg) => msg,
                None => {
                    info!("daemon closed the connection");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing");
                write_frame(&mut wr, &client.close()?).await?;
                return Ok(());
            }
        };

        let step = client.receive(msg)?;
        for out in &step.send {
            write_frame(&mut wr, out).await?;
        }
        for event in step.events {
            match event {
                ClientEvent::Connected { version } => {
                    info!(version, "connected");
                    write_frame(&mut wr, &client.register(filter)?).await?;
                }
                ClientEvent::Refused { error } => anyhow::bail!("handshake refused: {error}"),
                ClientEvent::Registered { filter, .. } => info!(?filter, "registered"),
                ClientEvent::RequestFailed { token, error } => {
                    anyhow::bail!("request {token:#x} refused: {error}")
                }
                ClientEvent::Ask(ev) => {
                    info!(token = ev.token, uid = ev.uid, rule = ev.rule_id, path = ?ev.path, %verdict, "answering");
                    write_frame(&mut wr, &client.answer(ev.token, verdict, delegate)?).await?;
                }
                ClientEvent::Notify(ev) => {
                    info!(token = ev.token, uid = ev.uid, rule = ev.rule_id, path = ?ev.path, "notification");
                }
                ClientEvent::Outcome {
                    token,
                    you,
                    uid,
                    verdict,
                } => {
                    info!(token, you, decided_by = uid, %verdict, "outcome");
                    println!("{token} {} {uid} {verdict}", if you { "you" } else { "other" });
                    if once {
                        write_frame(&mut wr, &client.close()?).await?;
                        return Ok(());
                    }
                }
                ClientEvent::AnswerRejected { token, error } => {
                    warn!(token, error, "answer rejected");
                }
                ClientEvent::Status { key, value } => info!(key, value, "status"),
                ClientEvent::Unregistered { .. } | ClientEvent::Closed => {}
            }
        }
    }
}
