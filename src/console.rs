//! Text command console for operating a running server.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::index::lifecycle::CoordinatorStatus;
use crate::ingest::{BuildReport, CatalogBuilder};

const HELP: &str = "\
commands:
  help            show this message
  build <file>    catalogue new products from <file> and rebuild the index
  reindex         rebuild the index from stored product images
  status          show the live index
  exit            stop the server
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Build(PathBuf),
    Reindex,
    Status,
    Exit,
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "" => Command::Empty,
        "help" | "?" => Command::Help,
        "build" if !rest.is_empty() => Command::Build(PathBuf::from(unquote(rest))),
        "reindex" => Command::Reindex,
        "status" => Command::Status,
        "exit" | "quit" => Command::Exit,
        _ => Command::Unknown(line.to_string()),
    }
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

/// Why the console stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator asked the server to stop.
    Exit,
    /// Input ended; the server keeps running.
    InputClosed,
}

/// Forward lines from a blocking reader (usually stdin) over a channel.
///
/// The reader runs on its own OS thread, outside the runtime's blocking pool,
/// so a read that never returns cannot hold up runtime shutdown. The channel
/// closes when the reader hits end of input or an error.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "console input failed");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start console input thread");
    }
    rx
}

/// Execute commands from `input` until `exit` or until the channel closes.
pub async fn run_console<W>(
    mut input: mpsc::Receiver<String>,
    mut output: W,
    builder: Arc<CatalogBuilder>,
) -> Result<ConsoleExit>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(b"type 'help' for commands\n").await?;
    output.flush().await?;

    while let Some(line) = input.recv().await {
        let reply = match parse_command(&line) {
            Command::Empty => continue,
            Command::Help => HELP.to_string(),
            Command::Build(path) => match builder.build_from_file(&path).await {
                Ok(report) => describe_report(&report),
                Err(e) => format!("build failed: {e}\n"),
            },
            Command::Reindex => match builder.reindex().await {
                Ok(report) => describe_report(&report),
                Err(e) => format!("reindex failed: {e}\n"),
            },
            Command::Status => describe_status(&builder.coordinator().status()),
            Command::Exit => {
                output.write_all(b"shutting down\n").await?;
                output.flush().await?;
                info!("exit requested from console");
                return Ok(ConsoleExit::Exit);
            }
            Command::Unknown(input) => {
                format!("unknown command '{input}', type 'help' for commands\n")
            }
        };
        output.write_all(reply.as_bytes()).await?;
        output.flush().await?;
    }

    info!("console input closed, server keeps running");
    Ok(ConsoleExit::InputClosed)
}

fn describe_report(report: &BuildReport) -> String {
    let mut out = String::new();
    for failed in &report.failed {
        out.push_str(&format!("  skipped {}: {}\n", failed.name, failed.reason));
    }
    match &report.snapshot_id {
        None => out.push_str(&format!(
            "catalog is current ({} already catalogued), index unchanged\n",
            report.already_catalogued
        )),
        Some(id) => out.push_str(&format!(
            "added {} products, indexed {} images, snapshot {id} {}\n",
            report.added.len(),
            report.training_entries,
            if report.published {
                "published"
            } else {
                "awaiting adoption"
            }
        )),
    }
    out
}

fn describe_status(status: &CoordinatorStatus) -> String {
    let state = format!("{:?}", status.state).to_ascii_lowercase();
    match &status.live {
        Some(live) => format!(
            "state {state}; live snapshot {} built {} ({} descriptors, {} products, {})\n",
            live.snapshot_id, live.built_at, live.descriptors, live.products, live.algorithm
        ),
        None => format!("state {state}; no index loaded\n"),
    }
}
