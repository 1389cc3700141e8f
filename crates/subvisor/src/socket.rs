// ABOUTME: Unix socket control surface for the subvisor daemon.
// ABOUTME: Newline-delimited JSON: list, control and subscribe requests, plus a client.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use subvisor_core::{Action, Event, SubprocessInfo, Subscription, SupervisorError};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "list")]
    List,
    #[serde(rename = "control")]
    Control { id: String, action: Action },
    /// Turns the connection into an event stream
    #[serde(rename = "subscribe")]
    Subscribe,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocesses: Option<Vec<SubprocessInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess: Option<SubprocessInfo>,
}

impl Response {
    fn listing(subprocesses: Vec<SubprocessInfo>) -> Self {
        Self {
            success: true,
            subprocesses: Some(subprocesses),
            ..Self::default()
        }
    }

    fn single(subprocess: SubprocessInfo) -> Self {
        Self {
            success: true,
            subprocess: Some(subprocess),
            ..Self::default()
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Commands sent to the daemon's control loop from socket handlers
pub enum SocketCommand {
    List {
        reply: oneshot::Sender<Vec<SubprocessInfo>>,
    },
    Control {
        id: String,
        action: Action,
        reply: oneshot::Sender<Result<SubprocessInfo, SupervisorError>>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
}

/// `$XDG_RUNTIME_DIR/subvisor.sock`, or `/tmp/subvisor.sock` without a runtime dir.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir)
        .join("subvisor.sock")
}

/// Bind the control socket, replacing a stale socket file.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    tracing::info!(path = %path.display(), "Socket server listening");
    Ok(listener)
}

pub async fn run_socket_server(
    listener: UnixListener,
    cmd_tx: mpsc::Sender<SocketCommand>,
) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, cmd_tx).await {
                tracing::warn!(error = %e, "Socket connection error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, cmd_tx: mpsc::Sender<SocketCommand>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                write_json(&mut writer, &Response::failure(format!("invalid request: {}", e)))
                    .await?;
                continue;
            }
        };

        if request == Request::Subscribe {
            return stream_events(writer, &cmd_tx).await;
        }

        let response = handle_request(request, &cmd_tx).await;
        write_json(&mut writer, &response).await?;
    }

    Ok(())
}

async fn handle_request(request: Request, cmd_tx: &mpsc::Sender<SocketCommand>) -> Response {
    match request {
        Request::List => {
            let (reply, rx) = oneshot::channel();
            if cmd_tx.send(SocketCommand::List { reply }).await.is_err() {
                return Response::failure("Supervisor unavailable");
            }
            match rx.await {
                Ok(subprocesses) => Response::listing(subprocesses),
                Err(_) => Response::failure("No response"),
            }
        }
        Request::Control { id, action } => {
            let (reply, rx) = oneshot::channel();
            if cmd_tx
                .send(SocketCommand::Control { id, action, reply })
                .await
                .is_err()
            {
                return Response::failure("Supervisor unavailable");
            }
            match rx.await {
                Ok(Ok(info)) => Response::single(info),
                Ok(Err(e)) => Response::failure(e.to_string()),
                Err(_) => Response::failure("No response"),
            }
        }
        Request::Subscribe => Response::failure("subscribe must be sent on its own connection"),
    }
}

/// Forward every broadcast event to the client until it disconnects.
async fn stream_events(
    mut writer: OwnedWriteHalf,
    cmd_tx: &mpsc::Sender<SocketCommand>,
) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    if cmd_tx.send(SocketCommand::Subscribe { reply }).await.is_err() {
        write_json(&mut writer, &Response::failure("Supervisor unavailable")).await?;
        return Ok(());
    }
    let Ok(mut subscription) = rx.await else {
        write_json(&mut writer, &Response::failure("No response")).await?;
        return Ok(());
    };

    tracing::debug!(subscriber = subscription.id(), "Socket subscriber attached");
    write_json(
        &mut writer,
        &Response {
            success: true,
            ..Response::default()
        },
    )
    .await?;

    while let Some(event) = subscription.recv().await {
        if let Err(e) = write_json(&mut writer, event.as_ref()).await {
            // Dropping the subscription removes it from the broadcaster.
            tracing::debug!(subscriber = subscription.id(), error = %e, "Socket subscriber gone");
            break;
        }
    }
    Ok(())
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)? + "\n";
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

/// Client side of the control socket.
pub struct SocketClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SocketClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "Failed to connect to {} (is `subvisor run` running?)",
                path.display()
            )
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        write_json(&mut self.writer, request).await?;
        let line = self
            .lines
            .next_line()
            .await?
            .context("Daemon closed the connection")?;
        serde_json::from_str(&line).context("Invalid response from daemon")
    }

    pub async fn list(&mut self) -> Result<Vec<SubprocessInfo>> {
        let response = self.request(&Request::List).await?;
        if !response.success {
            bail!(response.error.unwrap_or_else(|| "list failed".to_string()));
        }
        Ok(response.subprocesses.unwrap_or_default())
    }

    pub async fn control(&mut self, id: &str, action: Action) -> Result<SubprocessInfo> {
        let response = self
            .request(&Request::Control {
                id: id.to_string(),
                action,
            })
            .await?;
        if !response.success {
            bail!(response
                .error
                .unwrap_or_else(|| format!("{} failed", action)));
        }
        response
            .subprocess
            .context("Daemon response is missing the subprocess")
    }

    /// Switch this connection to event streaming.
    pub async fn subscribe(mut self) -> Result<EventStream> {
        let response = self.request(&Request::Subscribe).await?;
        if !response.success {
            bail!(response
                .error
                .unwrap_or_else(|| "subscribe failed".to_string()));
        }
        Ok(EventStream { lines: self.lines })
    }
}

/// Events read from a subscribed connection.
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl EventStream {
    /// Next event, or `None` when the daemon closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(
                serde_json::from_str(&line).context("Invalid event from daemon")?,
            )),
            None => Ok(None),
        }
    }
}
