//! Line-based control socket for driving the supervisor from outside.
//!
//! One command per line, split like a shell would:
//! `start`, `stop`, `status`, `logs`, `request <METHOD> <PATH> [JSON]`.
//! Every command gets one JSON line back.

use crate::error::SupervisorError;
use crate::gateway::RequestGateway;
use crate::process::Supervisor;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::io;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Logs,
    Request {
        method: Method,
        path: String,
        body: Option<Value>,
    },
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words = shell_words::split(line).map_err(|err| format!("Invalid command: {err}"))?;
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["start"] => Ok(Command::Start),
            ["stop"] => Ok(Command::Stop),
            ["status"] => Ok(Command::Status),
            ["logs"] => Ok(Command::Logs),
            ["request", method, path, rest @ ..] if rest.len() <= 1 => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("Invalid method {method:?}"))?;
                let body = match rest.first() {
                    Some(raw) => Some(
                        serde_json::from_str(raw).map_err(|err| format!("Invalid JSON body: {err}"))?,
                    ),
                    None => None,
                };
                Ok(Command::Request {
                    method,
                    path: path.to_string(),
                    body,
                })
            }
            [] => Err("Empty command".into()),
            _ => Err(format!("Unknown command {line:?}")),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Success { ok: bool, result: Value },
    Failure { ok: bool, error: String },
}

impl Reply {
    fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Reply::Success { ok: true, result },
            Err(err) => Reply::error(err),
        }
    }

    fn error(err: impl ToString) -> Self {
        Reply::Failure {
            ok: false,
            error: err.to_string(),
        }
    }
}

impl From<Result<Value, SupervisorError>> for Reply {
    fn from(result: Result<Value, SupervisorError>) -> Self {
        match result {
            Ok(value) => Reply::ok(value),
            Err(err) => Reply::error(err),
        }
    }
}

/// Binds the socket and serves clients in the background.
#[instrument(skip(supervisor))]
pub fn setup(path: &Path, supervisor: Supervisor) -> io::Result<JoinHandle<()>> {
    if path.exists() {
        debug!("Removing stale socket");
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("Opened socket at {}", path.to_string_lossy());
    Ok(tokio::spawn(
        run_socket(listener, supervisor).instrument(info_span!("socket", path = %path.display())),
    ))
}

async fn run_socket(listener: UnixListener, supervisor: Supervisor) {
    let gateway = RequestGateway::new(supervisor.clone());
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let peer_cred = stream
                    .peer_cred()
                    .map(|c| format!("{c:?}"))
                    .unwrap_or_else(|_| "<unknown>".into());
                let supervisor = supervisor.clone();
                let gateway = gateway.clone();
                tokio::spawn(
                    async move {
                        if let Err(err) = handle_client(stream, supervisor, gateway).await {
                            warn!(?err, "Client error");
                        }
                    }
                    .instrument(info_span!("handle_client", ?peer_cred)),
                );
            }
            Err(err) => {
                error!(?err, "Failed to accept connection");
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    supervisor: Supervisor,
    gateway: RequestGateway,
) -> io::Result<()> {
    debug!("Client connection opened");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            debug!("Client connection closed");
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.trim().parse::<Command>() {
            Ok(command) => execute(command, &supervisor, &gateway).await,
            Err(err) => Reply::error(err),
        };
        let mut out = serde_json::to_vec(&reply).map_err(io::Error::from)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
}

async fn execute(command: Command, supervisor: &Supervisor, gateway: &RequestGateway) -> Reply {
    info!(?command, "Control command");
    match command {
        Command::Start => match supervisor.start().await {
            Ok(outcome) => Reply::ok(json!({ "outcome": outcome, "status": supervisor.status() })),
            Err(err) => Reply::error(err),
        },
        Command::Stop => match supervisor.stop().await {
            Ok(outcome) => Reply::ok(json!({ "outcome": outcome, "status": supervisor.status() })),
            Err(err) => Reply::error(err),
        },
        Command::Status => Reply::ok(supervisor.status()),
        Command::Logs => Reply::ok(supervisor.recent_output()),
        Command::Request { method, path, body } => {
            gateway.request(method, &path, body.as_ref(), None).await.into()
        }
    }
}
