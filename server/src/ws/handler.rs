//! WebSocket upgrade handler.
//!
//! Runs the handshake checks, upgrades the HTTP connection and drives the
//! per-connection reader and writer loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::messages::{DataType, PROTOCOL_NAME};
use super::socket::Socket;
use super::transport::{decode, decode_binary, frame_channel, Frame};
use crate::error::{close_codes, ServerError};
use crate::middleware::Verdict;
use crate::server::{Server, ServerEvent, ServerShared};

/// How long the writer may keep flushing after the reader stops.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// The HTTP request a socket was upgraded from.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Request headers.
    pub headers: HeaderMap,
    /// Request URI.
    pub uri: Uri,
    /// Raw peer address.
    pub remote: Option<SocketAddr>,
    /// JSON attachment from the `a` query parameter.
    pub attachment: Option<Value>,
    /// Signed auth token from the sub-protocol or the `t` query parameter.
    pub signed_token: Option<String>,
}

impl UpgradeRequest {
    /// Returns a header value as a string.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the `Origin` header.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.header(header::ORIGIN.as_str())
    }
}

/// Upgrade route handler.
pub async fn upgrade_handler(State(server): State<Server>, request: Request) -> Response {
    let shared = Arc::clone(&server.shared);
    shared.counters.record_http_request();

    let (mut parts, _body) = request.into_parts();
    if !is_upgrade(&parts.headers) {
        return upgrade_required().await;
    }

    if shared.is_refusing_connections() {
        debug!("Refused upgrade while connections are refused");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !shared.origins.check(origin) {
        let origin = origin.unwrap_or("null");
        warn!("Rejected upgrade from origin {}", origin);
        shared.events.emit(&ServerEvent::Warning(ServerError::InvalidAction(format!(
            "Failed to authorize socket handshake - Invalid origin: {origin}"
        ))));
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some((protocol, protocol_token)) = negotiate_protocol(&parts.headers) else {
        warn!("Rejected upgrade without the {} sub-protocol", PROTOCOL_NAME);
        return (StatusCode::BAD_REQUEST, "Unsupported sub-protocol").into_response();
    };

    let (attachment, query_token) = parse_query(&parts.uri);
    let request = UpgradeRequest {
        headers: parts.headers.clone(),
        uri: parts.uri.clone(),
        remote: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
        attachment,
        signed_token: protocol_token.or(query_token),
    };

    let middleware = shared.middlewares.read().upgrade.clone();
    if let Some(middleware) = middleware {
        match middleware.on_upgrade(&request).await {
            Verdict::Allow => {}
            Verdict::Block(block) => {
                debug!("Upgrade blocked by middleware: {}", block);
                let status = StatusCode::from_u16(block.code)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::FORBIDDEN);
                return (status, block.message().to_string()).into_response();
            }
            Verdict::Fault(e) => {
                shared
                    .events
                    .emit(&ServerEvent::Error(ServerError::Internal(e)));
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &server).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let mut ws = ws.protocols([protocol]);
    if let Some(max_payload) = shared.options.max_payload {
        ws = ws.max_message_size(max_payload);
    }

    ws.on_upgrade(move |socket| run_connection(socket, shared, request))
}

/// Health route handler.
pub async fn health_handler(State(server): State<Server>) -> Response {
    server.shared.counters.record_http_request();
    if server.shared.check_health().await {
        (StatusCode::OK, "Healthy").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Unhealthy").into_response()
    }
}

/// Fallback for plain HTTP requests.
pub async fn upgrade_required() -> Response {
    (StatusCode::UPGRADE_REQUIRED, "Upgrade Required").into_response()
}

/// Counts the request and falls back to 426.
pub(crate) async fn fallback_handler(State(server): State<Server>) -> Response {
    server.shared.counters.record_http_request();
    upgrade_required().await
}

async fn run_connection(ws: WebSocket, shared: Arc<ServerShared>, request: UpgradeRequest) {
    let (sink, mut queue) = frame_channel();
    let socket = Socket::new(Arc::clone(&shared), request, sink);
    shared.register(&socket);

    let (mut ws_sender, mut ws_receiver) = ws.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let (message, last) = match frame {
                Frame::Text(text) => (Message::Text(text), false),
                Frame::Ping => (Message::Ping(Bytes::new()), false),
                Frame::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
                Frame::Terminate => break,
            };
            if ws_sender.send(message).await.is_err() || last {
                break;
            }
        }
    });

    tokio::spawn(ServerShared::admit(Arc::clone(&shared), Arc::clone(&socket)));

    loop {
        let message = tokio::select! {
            () = socket.closed() => break,
            message = ws_receiver.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("Socket {} read error: {}", socket.id(), e);
                break;
            }
            None => break,
        };

        socket.mark_alive();
        let (packet, data_type) = match message {
            Message::Text(text) => (decode(text.as_str()), DataType::Json),
            Message::Binary(bytes) => (decode_binary(&bytes), DataType::Binary),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((close_codes::NO_STATUS, None), |frame| {
                    let reason = frame.reason.as_str().to_string();
                    (frame.code, Some(reason).filter(|r| !r.is_empty()))
                });
                socket.handle_transport_close(code, reason);
                break;
            }
        };

        shared.counters.record_ws_message();
        match packet {
            Ok(packet) => socket.handle_packet(packet, data_type).await,
            Err(e) => {
                warn!("Socket {} sent a bad message: {}", socket.id(), e);
                socket.disconnect(close_codes::BAD_MESSAGE, Some("Bad message"));
                break;
            }
        }
    }

    if socket.is_open() {
        socket.handle_transport_close(close_codes::ABNORMAL, None);
    }
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Picks the offered sub-protocol, either `switchyard` or
/// `<signedToken>@switchyard`.
fn negotiate_protocol(headers: &HeaderMap) -> Option<(String, Option<String>)> {
    let offered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?;
    offered.split(',').map(str::trim).find_map(|entry| {
        if entry == PROTOCOL_NAME {
            return Some((entry.to_string(), None));
        }
        match entry.rsplit_once('@') {
            Some((token, name)) if name == PROTOCOL_NAME && !token.is_empty() => {
                Some((entry.to_string(), Some(token.to_string())))
            }
            _ => None,
        }
    })
}

fn parse_query(uri: &Uri) -> (Option<Value>, Option<String>) {
    let mut attachment = None;
    let mut token = None;
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "a" => attachment = serde_json::from_str(&value).ok(),
                "t" if !value.is_empty() => token = Some(value.into_owned()),
                _ => {}
            }
        }
    }
    (attachment, token)
}
