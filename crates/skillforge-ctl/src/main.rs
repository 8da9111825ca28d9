//! skillforge-ctl - administrative CLI for skillforged
//!
//! Usage:
//!   skillforge-ctl backup list --kind full
//!   skillforge-ctl backup now
//!   skillforge-ctl backup restore <file> --yes
//!   skillforge-ctl review force
//!   skillforge-ctl events

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use skillforge_core::ipc::IpcStream;
use skillforge_core::{BackupKind, BackupRecord, ForgeConfig};
use skillforge_rpc::methods::{self, ForceReviewResult};
use skillforge_rpc::protocol::{Notification, Request, RequestId, Response};

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Parser, Debug)]
#[command(name = "skillforge-ctl")]
#[command(about = "Administer a running skillforged daemon")]
#[command(version)]
struct Args {
    /// IPC endpoint (socket path or host:port); defaults to the configured one
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Print raw JSON results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the daemon answers
    Ping,
    /// Backup operations
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Activity review operations
    #[command(subcommand)]
    Review(ReviewCommand),
    /// Print gateway events as they happen
    Events,
    /// List the methods the daemon understands
    Methods,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// List backups, newest first
    List {
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Take a backup now
    Now {
        #[arg(short, long, value_enum, default_value_t = KindArg::Inc)]
        kind: KindArg,
    },
    /// Replace the live database with a backup
    Restore {
        file: PathBuf,
        /// Confirm replacing the live database
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ReviewCommand {
    /// Move due scheduled activities to pending review now
    Force,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum KindArg {
    Inc,
    Full,
}

impl From<KindArg> for BackupKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Inc => BackupKind::Incremental,
            KindArg::Full => BackupKind::Full,
        }
    }
}

#[derive(Clone)]
struct IpcClient {
    endpoint: String,
}

impl IpcClient {
    async fn connect(&self) -> Result<IpcStream> {
        IpcStream::connect(&self.endpoint)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", self.endpoint))
    }

    async fn send(stream: &mut IpcStream, method: &str, params: Option<Value>) -> Result<()> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, params, RequestId::Number(id));
        let request_json = serde_json::to_string(&request)?;
        debug!(%method, "IPC -> {}", request_json);
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut stream = self.connect().await?;
        Self::send(&mut stream, method, params).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Err(anyhow!("Daemon closed connection without response"));
        }
        let line = line.trim();
        debug!(%method, "IPC <- {}", line);

        let response: Response = serde_json::from_str(line)?;
        response
            .into_result()
            .map_err(|err| anyhow!("{} failed: {}", method, err))
    }

    async fn watch_events(&self, raw: bool) -> Result<()> {
        let mut stream = self.connect().await?;
        Self::send(&mut stream, methods::EVENTS_SUBSCRIBE, None).await?;

        let mut lines = BufReader::new(stream).lines();
        let ack = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Daemon closed connection without response"))?;
        let ack: Response = serde_json::from_str(&ack)?;
        ack.into_result().map_err(|err| anyhow!("Subscribe failed: {}", err))?;
        eprintln!("Listening for events (Ctrl+C to stop)");

        while let Some(line) = lines.next_line().await? {
            let notification: Notification = match serde_json::from_str(&line) {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Ignoring unexpected line");
                    continue;
                }
            };
            let params = notification.params.unwrap_or(Value::Null);
            if raw {
                println!("{}", params);
            } else {
                println!("{}", describe_event(&params));
            }
        }
        Ok(())
    }
}

fn describe_event(params: &Value) -> String {
    match params.get("event").and_then(|v| v.as_str()) {
        Some("activitiesUpdated") => {
            format!("activities updated: {}", params["count"])
        }
        Some("userNotification") => format!(
            "{}: {}",
            params["title"].as_str().unwrap_or_default(),
            params["body"].as_str().unwrap_or_default()
        ),
        _ => params.to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} B", bytes)
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}

fn print_record(record: &BackupRecord) {
    println!(
        "{:<17} {:<4} {:>10}  {}",
        record.timestamp,
        record.kind.as_str(),
        format_size(record.size_bytes),
        record.file.display()
    );
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let endpoint = match args.endpoint {
        Some(endpoint) => endpoint,
        None => {
            ForgeConfig::load()
                .context("Failed to load configuration")?
                .ipc_endpoint
        }
    };
    let client = IpcClient { endpoint };

    match args.command {
        Command::Ping => {
            client.call(methods::PING, None).await?;
            println!("skillforged is running");
        }
        Command::Methods => {
            for method in methods::all_methods() {
                println!("{:<24} {}", method.name, method.description);
            }
        }
        Command::Events => client.watch_events(args.json).await?,
        Command::Review(ReviewCommand::Force) => {
            let result = client.call(methods::TRANSITION_FORCE_REVIEW, None).await?;
            if args.json {
                println!("{}", result);
            } else {
                let result: ForceReviewResult = serde_json::from_value(result)?;
                println!("{} activities moved to pending review", result.count);
            }
        }
        Command::Backup(BackupCommand::List { kind }) => {
            let params = kind.map(|k| json!({ "kind": BackupKind::from(k) }));
            let result = client.call(methods::BACKUP_LIST, params).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let records: Vec<BackupRecord> = serde_json::from_value(result)?;
                if records.is_empty() {
                    println!("No backups");
                }
                for record in &records {
                    print_record(record);
                }
            }
        }
        Command::Backup(BackupCommand::Now { kind }) => {
            let params = json!({ "kind": BackupKind::from(kind) });
            let result = client.call(methods::BACKUP_NOW, Some(params)).await?;
            if args.json {
                println!("{}", result);
            } else {
                let record: BackupRecord = serde_json::from_value(result)?;
                print_record(&record);
            }
        }
        Command::Backup(BackupCommand::Restore { file, yes }) => {
            if !yes {
                bail!("Restore replaces the live database; pass --yes to confirm");
            }
            // The daemon resolves paths against its own working directory
            let file = if file.is_absolute() {
                file
            } else {
                std::env::current_dir()?.join(file)
            };
            client
                .call(methods::BACKUP_RESTORE, Some(json!({ "file": file })))
                .await?;
            println!("Restored {}", file.display());
        }
    }
    Ok(())
}
