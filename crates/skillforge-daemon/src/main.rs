//! skillforged - background daemon for SkillForge
//!
//! Responsibilities:
//! - Own the database handle, backup manager and gateway (ForgeControl)
//! - Run the transition pass and the clock-aligned backup timers
//! - Expose the administrative JSON-RPC endpoint over a local socket

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use skillforge_core::ipc::IpcListener;
use skillforge_core::{
    ChannelGateway, ForgeConfig, ForgeControl, GatewayEvent, Scheduler, SchedulerOptions,
};
use skillforge_rpc::methods::{self, BackupKindParams, ForceReviewResult, RestoreParams};
use skillforge_rpc::protocol::{self, Notification, Request, RequestId, Response, RpcError};

#[derive(Clone)]
struct AppState {
    control: Arc<ForgeControl>,
    gateway: ChannelGateway,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("SKILLFORGE_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

// =========================
// IPC server
// =========================

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn handle_ipc_connection<S>(state: AppState, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let request = match protocol::parse_request(message) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Rejected IPC message");
                write_json(&mut writer, &Response::from_error(RequestId::Null, e)).await?;
                continue;
            }
        };

        if request.method == methods::EVENTS_SUBSCRIBE {
            let id = request.id.unwrap_or(RequestId::Null);
            let rx = state.gateway.subscribe();
            write_json(&mut writer, &Response::success(id, json!({ "subscribed": true }))).await?;
            debug!("IPC event subscriber attached");
            return stream_events(rx, reader, writer).await;
        }

        let resp = handle_ipc_request(&state, request).await;
        let json = protocol::encode_response(&resp)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}

/// Forward gateway events as notification lines until the peer disconnects
async fn stream_events<R, W>(
    mut rx: broadcast::Receiver<GatewayEvent>,
    mut reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("IPC event subscriber detached");
                        return Ok(());
                    }
                    // Input on a subscribed connection is ignored
                    Ok(_) => line.clear(),
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let notification =
                            Notification::new(methods::EVENT_NOTIFICATION, serde_json::to_value(&event)?);
                        write_json(&mut writer, &notification).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn respond<T: Serialize>(id: RequestId, result: skillforge_core::Result<T>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(v) => Response::success(id, v),
            Err(e) => Response::from_error(id, RpcError::Internal(e.to_string())),
        },
        Err(e) => {
            warn!(error = %e, "IPC operation failed");
            Response::from_error(id, RpcError::Application(e.to_string()))
        }
    }
}

async fn handle_ipc_request(state: &AppState, request: Request) -> Response {
    let id = request.id.clone().unwrap_or(RequestId::Null);
    let method = request.method.as_str();
    debug!(%method, "IPC request");

    match method {
        methods::PING => Response::success(id, json!({})),
        methods::BACKUP_LIST => {
            let params: BackupKindParams = match methods::parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return Response::from_error(id, e),
            };
            respond(id, state.control.list_backups(params.kind).await)
        }
        methods::BACKUP_NOW => {
            let params: BackupKindParams = match methods::parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return Response::from_error(id, e),
            };
            let kind = params.kind.unwrap_or_default();
            respond(id, state.control.backup_now(kind).await)
        }
        methods::BACKUP_RESTORE => {
            let params: RestoreParams = match methods::parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return Response::from_error(id, e),
            };
            info!(file = %params.file.display(), "Restore requested over IPC");
            let result = state.control.restore(params.file).await.map(|()| json!({}));
            respond(id, result)
        }
        methods::TRANSITION_FORCE_REVIEW => {
            let result = state
                .control
                .force_review()
                .await
                .map(|count| ForceReviewResult { count });
            respond(id, result)
        }
        methods::EVENTS_SUBSCRIBE => Response::from_error(
            id,
            RpcError::InvalidRequest(
                "events.subscribe is only available on a streaming connection".to_string(),
            ),
        ),
        _ => Response::from_error(id, RpcError::MethodNotFound(method.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ForgeConfig::load().context("Failed to load configuration")?;
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("Failed to create {}", config.home.display()))?;

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = config.logs_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skillforged.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panic hook: make sure panics land in the log file as well
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    info!(
        home = %config.home.display(),
        db = %config.db_path.display(),
        profile = config.profile.as_str(),
        "skillforged starting"
    );

    let gateway = ChannelGateway::default();
    let control = Arc::new(
        ForgeControl::open(&config, Arc::new(gateway.clone()))
            .context("Failed to open database")?,
    );
    let state = AppState {
        control: Arc::clone(&control),
        gateway,
    };

    let scheduler = Scheduler::new(control, SchedulerOptions::for_profile(config.profile)).start();

    let listener = IpcListener::bind(&config.ipc_endpoint)
        .await
        .with_context(|| format!("Failed to bind IPC endpoint {}", config.ipc_endpoint))?;
    info!(endpoint = %config.ipc_endpoint, "IPC server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(error = %e, "IPC accept failed");
                        continue;
                    }
                };
                let conn_state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_ipc_connection(conn_state, stream).await {
                        warn!(error = %e, "IPC connection error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    scheduler.shutdown().await;
    drop(listener);
    info!("skillforged stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Local};
    use serde_json::Value;
    use skillforge_core::{ActivityState, BackupManager, ForgeDB, RetentionPolicy};
    use tempfile::TempDir;

    fn setup() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("forgeskills.sqlite");
        let db = Arc::new(ForgeDB::open(&db_path).unwrap());
        let backups =
            BackupManager::new(&db_path, tmp.path().join("backups"), RetentionPolicy::default());
        let gateway = ChannelGateway::default();
        let control = Arc::new(ForgeControl::new(db, backups, Arc::new(gateway.clone())));
        (tmp, AppState { control, gateway })
    }

    fn request(method: &str, params: Option<Value>) -> Request {
        Request::new(method, params, RequestId::Number(7))
    }

    async fn call(state: &AppState, method: &str, params: Option<Value>) -> Response {
        handle_ipc_request(state, request(method, params)).await
    }

    async fn add_due_activity(state: &AppState) -> String {
        let control = &state.control;
        let a = control.create_activity("Lab".into(), None).await.unwrap();
        control
            .transition_activity(a.id.clone(), ActivityState::Analyzed, None)
            .await
            .unwrap();
        let yesterday = Local::now().date_naive() - Duration::days(1);
        control.schedule_activity(a.id.clone(), yesterday).await.unwrap();
        a.id
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let (_tmp, state) = setup();
        let resp = call(&state, methods::PING, None).await;
        assert_eq!(resp.id, RequestId::Number(7));
        assert_eq!(resp.into_result().unwrap(), json!({}));

        let err = call(&state, "backup.delete", None).await.into_result().unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_backup_now_defaults_to_incremental() {
        let (_tmp, state) = setup();
        let result = call(&state, methods::BACKUP_NOW, None).await.into_result().unwrap();
        assert_eq!(result["kind"], "INC");
        assert!(result["sizeBytes"].as_u64().unwrap() > 0);

        let result = call(&state, methods::BACKUP_NOW, Some(json!({"kind": "FULL"})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result["kind"], "FULL");

        let listed = call(&state, methods::BACKUP_LIST, Some(json!({"kind": "FULL"})))
            .await
            .into_result()
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let listed = call(&state, methods::BACKUP_LIST, None).await.into_result().unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_params_rejected() {
        let (_tmp, state) = setup();
        let err = call(&state, methods::BACKUP_NOW, Some(json!({"kind": "HOURLY"})))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, -32602);

        let err = call(&state, methods::BACKUP_RESTORE, None)
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn test_restore_errors_are_application_errors() {
        let (tmp, state) = setup();
        let file = tmp.path().join("not-a-backup.gz");
        std::fs::write(&file, b"x").unwrap();

        let err = call(&state, methods::BACKUP_RESTORE, Some(json!({ "file": file })))
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, protocol::APPLICATION_ERROR);
        assert!(err.message.starts_with("Not a backup artifact"));
    }

    #[tokio::test]
    async fn test_restore_roundtrip_over_ipc() {
        let (_tmp, state) = setup();
        let kept = state.control.create_activity("Kept".into(), None).await.unwrap();
        let record = call(&state, methods::BACKUP_NOW, Some(json!({"kind": "FULL"})))
            .await
            .into_result()
            .unwrap();
        let dropped = state.control.create_activity("Dropped".into(), None).await.unwrap();

        let result = call(
            &state,
            methods::BACKUP_RESTORE,
            Some(json!({ "file": record["file"] })),
        )
        .await
        .into_result()
        .unwrap();
        assert_eq!(result, json!({}));

        assert!(state.control.get_activity(kept.id).await.is_ok());
        assert!(state.control.get_activity(dropped.id).await.is_err());
    }

    #[tokio::test]
    async fn test_force_review() {
        let (_tmp, state) = setup();
        add_due_activity(&state).await;

        let result = call(&state, methods::TRANSITION_FORCE_REVIEW, None)
            .await
            .into_result()
            .unwrap();
        assert_eq!(result, json!({ "count": 1 }));

        let result = call(&state, methods::TRANSITION_FORCE_REVIEW, None)
            .await
            .into_result()
            .unwrap();
        assert_eq!(result, json!({ "count": 0 }));
    }

    #[tokio::test]
    async fn test_connection_serves_multiple_lines() {
        let (_tmp, state) = setup();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(handle_ipc_connection(state, server));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"{broken\n").await.unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, RequestId::Null);
        assert_eq!(resp.into_result().unwrap_err().code, -32700);

        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":2}\n")
            .await
            .unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, RequestId::Number(2));
        assert!(resp.error.is_none());

        drop(write_half);
        drop(lines);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_events_subscribe_streams_updates() {
        let (_tmp, state) = setup();
        add_due_activity(&state).await;
        let control = Arc::clone(&state.control);

        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(handle_ipc_connection(state, server));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut lines = BufReader::new(read_half).lines();
        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"events.subscribe\",\"id\":1}\n")
            .await
            .unwrap();
        let ack: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack.into_result().unwrap()["subscribed"], true);

        assert_eq!(control.force_review().await.unwrap(), 1);

        let line = lines.next_line().await.unwrap().unwrap();
        let notification: Notification = serde_json::from_str(&line).unwrap();
        assert_eq!(notification.method, methods::EVENT_NOTIFICATION);
        let params = notification.params.unwrap();
        assert_eq!(params["event"], "activitiesUpdated");
        assert_eq!(params["count"], 1);

        let line = lines.next_line().await.unwrap().unwrap();
        let notification: Notification = serde_json::from_str(&line).unwrap();
        assert_eq!(notification.params.unwrap()["event"], "userNotification");

        drop(write_half);
        drop(lines);
        server_task.await.unwrap().unwrap();
    }
}
