use crate::manager::SiteManager;
use anyhow::Result;
use std::path::Path;
use studio_core::{IpcRequest, IpcResponse, StudioEvent};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc::Sender};
use tracing::{debug, error, info};

/// Bind `socket_path`, replacing a stale socket left by a dead daemon.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if tokio::fs::metadata(socket_path).await.is_ok() {
        // Try to connect to see if it's alive
        if UnixStream::connect(socket_path).await.is_ok() {
            anyhow::bail!(
                "Socket {} is already in use. Is studio-server already running?",
                socket_path.display()
            );
        }
        tokio::fs::remove_file(socket_path).await?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!("IPC server listening on {:?}", socket_path);
    Ok(listener)
}

pub async fn serve(listener: UnixListener, manager: SiteManager, shutdown_tx: Sender<()>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let manager = manager.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager, shutdown_tx).await {
                        error!("Error handling connection: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

/// One JSON request per line, one JSON response per line, until the client
/// hangs up or subscribes.
async fn handle_connection(
    stream: UnixStream,
    manager: SiteManager,
    shutdown_tx: Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                write_line(&mut writer, &IpcResponse::Error(format!("Invalid request: {e}")))
                    .await?;
                continue;
            }
        };
        debug!("Received request: {:?}", request);

        if matches!(request, IpcRequest::Subscribe) {
            let rx = manager.subscribe();
            write_line(&mut writer, &IpcResponse::Ok).await?;
            return stream_events(&mut writer, rx).await;
        }

        let response = dispatch(request, &manager, &shutdown_tx).await;
        write_line(&mut writer, &response).await?;
    }
    Ok(())
}

async fn stream_events<W>(writer: &mut W, mut rx: broadcast::Receiver<StudioEvent>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match rx.recv().await {
            Ok(event) => {
                if write_line(writer, &event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Subscriber lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn dispatch(
    request: IpcRequest,
    manager: &SiteManager,
    shutdown_tx: &Sender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::GetSiteDetails => match manager.get_site_details().await {
            Ok(sites) => IpcResponse::Sites(sites),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::CreateSite { path, name } => match manager.create_site(&path, name).await {
            Ok(sites) => IpcResponse::Sites(sites),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::UpdateSite { id, update } => match manager.update_site(id, update).await {
            Ok(site) => IpcResponse::Site(site),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::DeleteSite { id, delete_files } => {
            match manager.delete_site(id, delete_files).await {
                Ok(_) => IpcResponse::Ok,
                Err(e) => IpcResponse::Error(e.to_string()),
            }
        }
        IpcRequest::StartServer { id } => IpcResponse::Site(manager.start_server(id).await),
        IpcRequest::StopServer { id } => IpcResponse::Site(manager.stop_server(id).await),
        IpcRequest::ExecuteWpCli { id, command } => {
            match manager.execute_wp_cli(id, &command).await {
                Ok(output) => IpcResponse::WpCli {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                },
                Err(e) => IpcResponse::Error(e.to_string()),
            }
        }
        IpcRequest::ArchiveSite { id } => match manager.archive_site(id).await {
            Ok(path) => IpcResponse::Archive(path),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::ExportSite {
            id,
            backup_file,
            includes,
        } => match manager.export_site(id, backup_file, includes).await {
            Ok(path) => IpcResponse::Archive(path),
            Err(e) => IpcResponse::Error(e.to_string()),
        },
        IpcRequest::ImportSite { id, backup_file } => {
            match manager.import_site(id, backup_file).await {
                Ok(site) => IpcResponse::Site(site),
                Err(e) => IpcResponse::Error(e.to_string()),
            }
        }
        IpcRequest::GetProgress { id } => IpcResponse::Progress(manager.progress(id)),
        IpcRequest::Shutdown => {
            let _ = shutdown_tx.send(()).await;
            IpcResponse::Ok
        }
        IpcRequest::Subscribe => {
            IpcResponse::Error("Subscribe is only valid as a connection's request".to_string())
        }
    }
}
