use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{supported_methods, DispatchOutcome, ToolDispatcher};
use crate::exec::now_ms;
use crate::protocol::{
    event_frame, frame_kind, parse_frame_text, parse_rpc_request, rpc_error_response_frame,
    rpc_success_response_frame, FrameKind, RpcRequestFrame,
};

const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 256 * 1024;
const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 4096;

pub struct ToolServer {
    server: ServerConfig,
    sweep_interval: Duration,
    dispatcher: Arc<ToolDispatcher>,
}

/// How a WebSocket connection ended, derived from the transport error
/// variant rather than its message text.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TransportEnd {
    Closed,
    Reset,
    Failed(String),
}

impl TransportEnd {
    fn classify(err: &WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Self::Reset,
            WsError::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                Self::Reset
            }
            other => Self::Failed(other.to_string()),
        }
    }
}

impl ToolServer {
    pub fn new(
        server: ServerConfig,
        sweep_interval_ms: u64,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            server,
            sweep_interval: Duration::from_millis(sweep_interval_ms.max(10)),
            dispatcher,
        }
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| format!("failed binding listener on {}", self.server.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("shellgate listening on ws://{bound_addr}");

        let sweeper_task = self.spawn_sweeper_task();
        let http_task = self.spawn_control_http_task();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let dispatcher = self.dispatcher.clone();
                            let settings = self.server.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, dispatcher, settings).await {
                                    warn!("connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    }
                }
            }
        }

        sweeper_task.abort();
        let _ = sweeper_task.await;
        if let Some(task) = http_task {
            task.abort();
            let _ = task.await;
        }
        let terminated = self.dispatcher.registry().terminate_all().await;
        info!("shutdown complete, terminated {terminated} running session(s)");
        Ok(())
    }

    fn spawn_sweeper_task(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.dispatcher.registry().clone();
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = registry.evict_expired().await;
                if !evicted.is_empty() {
                    debug!("sweeper evicted {} session(s)", evicted.len());
                }
            }
        })
    }

    fn spawn_control_http_task(&self) -> Option<tokio::task::JoinHandle<()>> {
        let bind = self.server.http_bind.clone()?;
        if bind.trim().is_empty() {
            return None;
        }
        let dispatcher = self.dispatcher.clone();
        Some(tokio::spawn(async move {
            let listener = match TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("control-http bind failed on {bind}: {err}");
                    return;
                }
            };
            let bound = listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(bind.clone());
            info!("control-http listening on http://{bound}");
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_control_http_connection(stream, dispatcher).await
                            {
                                warn!("control-http connection {remote_addr} failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("control-http accept failed: {err}");
                    }
                }
            }
        }))
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    dispatcher: Arc<ToolDispatcher>,
    settings: ServerConfig,
) -> Result<()> {
    let ws = timeout(
        Duration::from_millis(settings.handshake_timeout_ms),
        accept_async(stream),
    )
    .await
    .context("websocket handshake timed out")?
    .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let conn_id = format!("conn-{}", now_ms());
    let (mut write, mut read) = ws.split();

    let hello = event_frame(
        "hello",
        json!({
            "server": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "connId": conn_id,
            },
            "methods": supported_methods(),
        }),
    );
    write
        .send(Message::Text(hello.to_string()))
        .await
        .context("failed sending hello event")?;

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(settings.outbound_queue_capacity.max(8));
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    info!("client connected conn_id={conn_id} remote={remote_addr}");

    let end = loop {
        let Some(inbound) = read.next().await else {
            break TransportEnd::Closed;
        };
        let inbound = match inbound {
            Ok(message) => message,
            Err(err) => break TransportEnd::classify(&err),
        };
        match inbound {
            Message::Text(text) => {
                let frame = match parse_frame_text(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("invalid JSON frame on {conn_id}: {err:#}");
                        continue;
                    }
                };
                if frame_kind(&frame) != FrameKind::Req {
                    continue;
                }
                let Some(req) = parse_rpc_request(&frame) else {
                    let id = frame.get("id").and_then(Value::as_str).unwrap_or("unknown");
                    let response =
                        rpc_error_response_frame(id, "invalid_args", "malformed request frame", None);
                    let _ = out_tx.send(Message::Text(response.to_string())).await;
                    continue;
                };
                // execute_command may block up to its timeout; keep reading meanwhile
                let dispatcher = dispatcher.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = response_frame_for(&dispatcher, &req).await;
                    let _ = out_tx.send(Message::Text(response.to_string())).await;
                });
            }
            Message::Ping(payload) => {
                let _ = out_tx.try_send(Message::Pong(payload));
            }
            Message::Close(_) => break TransportEnd::Closed,
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    };

    match &end {
        TransportEnd::Closed => info!("client disconnected conn_id={conn_id}"),
        TransportEnd::Reset => info!("client reset connection conn_id={conn_id}"),
        TransportEnd::Failed(reason) => warn!("connection {conn_id} failed: {reason}"),
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn response_frame_for(dispatcher: &ToolDispatcher, req: &RpcRequestFrame) -> Value {
    match dispatcher.handle_request(req).await {
        DispatchOutcome::Handled(payload) => rpc_success_response_frame(&req.id, payload),
        DispatchOutcome::Error { code, message } => {
            rpc_error_response_frame(&req.id, code, &message, None)
        }
        DispatchOutcome::NotHandled => rpc_error_response_frame(
            &req.id,
            "invalid_args",
            &format!("unknown method: {}", req.method),
            None,
        ),
    }
}

async fn handle_control_http_connection(
    mut stream: tokio::net::TcpStream,
    dispatcher: Arc<ToolDispatcher>,
) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let req = RpcRequestFrame {
                id: "http-health".to_owned(),
                method: "health".to_owned(),
                params: json!({}),
            };
            let payload = dispatch_http_rpc(&dispatcher, req).await;
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", "/rpc/methods") => {
            let methods = supported_methods();
            let payload = json!({
                "ok": true,
                "count": methods.len(),
                "methods": methods
            });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("POST", "/rpc") => match parse_control_http_rpc_request(&request.body) {
            Ok(req) => {
                let payload = dispatch_http_rpc(&dispatcher, req).await;
                write_http_json_response(&mut stream, 200, &payload).await
            }
            Err(err) => {
                let payload = json!({
                    "ok": false,
                    "error": {
                        "code": "invalid_args",
                        "message": err.to_string()
                    }
                });
                write_http_json_response(&mut stream, 400, &payload).await
            }
        },
        ("GET", _) | ("POST", _) => {
            let payload = json!({
                "ok": false,
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
        _ => {
            let body = json!({
                "ok": false,
                "error": "method_not_allowed"
            });
            write_http_json_response(&mut stream, 405, &body).await
        }
    }
}

#[derive(Debug)]
struct ControlHttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn parse_control_http_rpc_request(body: &[u8]) -> Result<RpcRequestFrame> {
    let payload: Value = serde_json::from_slice(body).context("invalid /rpc JSON payload")?;
    let method = payload
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("invalid /rpc payload: method is required"))?
        .to_owned();
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http-rpc")
        .to_owned();
    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));
    Ok(RpcRequestFrame { id, method, params })
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

/// Offset one past the request body. Content lengths that would push the
/// request over the size cap are rejected before any body bytes are read.
fn http_body_end(header_end: usize, separator_len: usize, content_length: usize) -> Result<usize> {
    if content_length > CONTROL_HTTP_MAX_REQUEST_BYTES {
        anyhow::bail!("control-http content-length {content_length} exceeds max size");
    }
    header_end
        .checked_add(separator_len)
        .and_then(|body_start| body_start.checked_add(content_length))
        .filter(|end| *end <= CONTROL_HTTP_MAX_REQUEST_BYTES)
        .ok_or_else(|| anyhow::anyhow!("control-http request exceeds max size"))
}

async fn read_control_http_request(
    stream: &mut tokio::net::TcpStream,
) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                let body_end = http_body_end(header_end, separator_len, content_length)?;
                header_info = Some((header_end, separator_len, body_end));
            }
        }

        if let Some((_, _, body_end)) = header_info {
            if buffer.len() >= body_end {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let (header_end, separator_len, body_end) = header_info.ok_or_else(|| {
        anyhow::anyhow!("invalid control-http request: missing header terminator")
    })?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments.next().unwrap_or_default().to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path_raw = segments.next().unwrap_or("/");
    let path = path_raw.split('?').next().unwrap_or(path_raw).to_owned();
    if buffer.len() < body_end {
        anyhow::bail!("truncated control-http request body");
    }
    let body = buffer[header_end + separator_len..body_end].to_vec();
    Ok(Some(ControlHttpRequest { method, path, body }))
}

async fn dispatch_http_rpc(dispatcher: &ToolDispatcher, request: RpcRequestFrame) -> Value {
    match dispatcher.handle_request(&request).await {
        DispatchOutcome::Handled(payload) => json!({
            "ok": true,
            "result": payload
        }),
        DispatchOutcome::Error { code, message } => json!({
            "ok": false,
            "error": {
                "code": code,
                "message": message
            }
        }),
        DispatchOutcome::NotHandled => json!({
            "ok": false,
            "error": {
                "code": "invalid_args",
                "message": format!("unknown method: {}", request.method)
            }
        }),
    }
}

async fn write_http_json_response(
    stream: &mut tokio::net::TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing control-http JSON body")?;
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
