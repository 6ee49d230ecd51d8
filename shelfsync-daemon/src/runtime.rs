use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use shelfsync_core::{Config, FileStore, SubscriptionRepo};
use shelfsync_plugins::PluginRegistry;
use shelfsync_sync::{HttpSource, SyncEngine};

use crate::controller::{Controller, SyncRequest};
use crate::error::{io_err, DaemonError};
use crate::paths::{jobs_path, run_dir, shelfsync_root, socket_path, STORE_NAMESPACE};
use crate::protocol::{DaemonRequest, DaemonResponse, SubscriptionSummary};
use crate::queue::MemoryQueue;
use crate::transport::WebSocketTransport;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// File-backed store, built-in plugins and the HTTP remote source.
pub fn open_engine(home: &Path) -> Result<SyncEngine, DaemonError> {
    let store = FileStore::open_at(home, STORE_NAMESPACE)?;
    let repo = SubscriptionRepo::new(Arc::new(store));
    let plugins = PluginRegistry::with_builtins()?;
    Ok(SyncEngine::new(
        Arc::new(HttpSource::default()),
        Arc::new(plugins),
        repo,
    ))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let config = Config::load_at(&home)?;

    let queue = MemoryQueue::open(jobs_path(&home))?;
    let mut controller = Controller::new(open_engine(&home)?, Arc::new(queue), config.clone());
    if config.live {
        controller = controller.with_transport(Box::new(WebSocketTransport::new(
            config.stream_url.clone(),
        )));
    }
    serve(home, controller).await
}

/// Serve `controller` on the admin socket until `stop` or ctrl-c, then stop it.
async fn serve(home: PathBuf, controller: Controller) -> Result<(), DaemonError> {
    let started_at_unix = unix_seconds_now();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                controller,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let start_result = controller.start(None).await;
    match &start_result {
        Ok(()) => {
            tracing::info!(socket = %socket_path(&home).display(), "daemon running");
            let _ = shutdown_rx.recv().await;
        }
        Err(err) => {
            tracing::error!(error = %err, "controller failed to start");
            let _ = shutdown_tx.send(());
        }
    }

    let stop_result = controller.stop().await;
    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    start_result?;
    stop_result?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    controller: Controller,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let run = run_dir(&home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let controller = controller.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        controller,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    controller: Controller,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = matches!(request, DaemonRequest::Stop);
        let response = match dispatch(&home, &controller, request, started_at_unix).await {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => DaemonResponse::error(err.to_string()),
        };
        write_response(&mut writer, &response).await?;
        if stop {
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    home: &Path,
    controller: &Controller,
    request: DaemonRequest,
    started_at_unix: u64,
) -> Result<serde_json::Value, DaemonError> {
    match request {
        DaemonRequest::Status => {
            let status = controller.status().await?;
            Ok(json!({
                "running": true,
                "started_at_unix": started_at_unix,
                "socket": socket_path(home).display().to_string(),
                "root": shelfsync_root(home).display().to_string(),
                "controller": status,
            }))
        }
        DaemonRequest::List => {
            let summaries: Vec<SubscriptionSummary> = controller
                .repo()
                .load_all()
                .await?
                .iter()
                .map(SubscriptionSummary::from)
                .collect();
            Ok(serde_json::to_value(summaries)?)
        }
        DaemonRequest::Subscribe { subscription } => {
            let subscription = controller.subscribe(subscription).await?;
            Ok(serde_json::to_value(SubscriptionSummary::from(&subscription))?)
        }
        DaemonRequest::Unsubscribe { id } => {
            let removed = controller.unsubscribe(&id).await?;
            Ok(json!({ "id": removed.id }))
        }
        DaemonRequest::Sync { id, all, skip } => {
            if id.is_none() && !all {
                return Err(DaemonError::Payload("sync needs an `id` or `all`".to_string()));
            }
            let job = controller
                .notify_sync(SyncRequest { id, all, skip }, Some(Duration::ZERO))
                .await?;
            Ok(json!({ "job": job.id, "type": job.kind }))
        }
        DaemonRequest::Stop => Ok(json!({ "stopping": true })),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG`-driven fmt subscriber, `info` by default. Safe to call twice.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
