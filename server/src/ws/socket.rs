//! Socket state machine.
//!
//! A [`Socket`] wraps one admitted connection. It owns the auth state, the
//! channel subscription list and the transport, and answers the built-in
//! procedures and receivers of the protocol.
//!
//! Lock order is `subscriptions → broker interest → topics`. Every
//! continuation after a middleware await re-checks that the socket is
//! still open before committing anything.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use super::handler::UpgradeRequest;
use super::messages::{procedures, pushes, receivers, DataType, Packet};
use super::topics::{group_topic, TopicMember, PING_TOPIC};
use super::transport::{Frame, FrameSink, PreparedPackage, Transport};
use crate::auth::{Claims, SignOptions};
use crate::emitter::{EventEmitter, ListenerId};
use crate::error::{close_codes, ErrorPayload, ServerError};
use crate::middleware::{Block, Verdict};
use crate::server::{ServerEvent, ServerShared};

/// Events emitted by a socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// The socket became authenticated or unauthenticated.
    AuthStateChange {
        /// New state.
        authenticated: bool,
    },
    /// A new auth token was assigned.
    Authenticate {
        /// The signed token.
        signed_token: String,
    },
    /// The auth token was removed.
    Deauthenticate,
    /// The socket subscribed to a channel.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// The socket left a channel.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// The server forcibly removed the socket from a channel.
    KickOut {
        /// Channel name.
        channel: String,
    },
    /// The socket closed.
    Disconnect {
        /// Close code.
        code: u16,
        /// Close reason.
        message: Option<String>,
    },
    /// Socket-level error, including protocol errors derived from close codes.
    Error(ServerError),
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<Arc<Claims>>,
    signed: Option<String>,
}

/// One admitted connection.
pub struct Socket {
    id: String,
    open: AtomicBool,
    alive: AtomicBool,
    auth: Mutex<AuthState>,
    subscriptions: Mutex<Vec<String>>,
    groups: Mutex<Vec<String>>,
    transport: Arc<Transport>,
    server: Arc<ServerShared>,
    request: UpgradeRequest,
    remote_address: Option<String>,
    remote_family: Option<u8>,
    events: EventEmitter<SocketEvent>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("authenticated", &self.is_authenticated())
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Creates a socket over an outbound sink.
    pub(crate) fn new(server: Arc<ServerShared>, request: UpgradeRequest, sink: FrameSink) -> Arc<Self> {
        let ack_timeout = Duration::from_millis(server.options.ack_timeout_ms);
        let remote_address = resolve_remote_address(&request);
        let remote_family = remote_address
            .as_deref()
            .and_then(|address| address.parse::<IpAddr>().ok())
            .map(|ip| if ip.is_ipv4() { 4 } else { 6 });

        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            open: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            auth: Mutex::new(AuthState::default()),
            subscriptions: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            transport: Arc::new(Transport::new(sink, ack_timeout)),
            server,
            request,
            remote_address,
            remote_family,
            events: EventEmitter::new(),
            closed: watch::Sender::new(false),
        })
    }

    /// Returns the socket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true until the socket closes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Returns true while an auth token is assigned.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth.lock().token.is_some()
    }

    /// Returns the current auth token claims.
    #[must_use]
    pub fn auth_token(&self) -> Option<Arc<Claims>> {
        self.auth.lock().token.clone()
    }

    /// Returns the current signed auth token.
    #[must_use]
    pub fn signed_auth_token(&self) -> Option<String> {
        self.auth.lock().signed.clone()
    }

    /// Returns the subscribed channels in subscription order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Returns true if the socket is subscribed to the channel.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().iter().any(|c| c == channel)
    }

    /// Returns the number of subscribed channels.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Returns the groups the socket has joined.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().clone()
    }

    /// Returns the remote address, preferring the first `X-Forwarded-For` entry.
    #[must_use]
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// Returns the remote port of the raw peer.
    #[must_use]
    pub fn remote_port(&self) -> Option<u16> {
        self.request.remote.map(|addr| addr.port())
    }

    /// Returns 4 or 6 depending on the remote address family.
    #[must_use]
    pub fn remote_family(&self) -> Option<u8> {
        self.remote_family
    }

    /// Returns the upgrade request the socket was created from.
    #[must_use]
    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// Returns the transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Registers an event listener.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SocketEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    /// Registers a listener for the next event only.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SocketEvent) + Send + Sync + 'static,
    {
        self.events.once(listener)
    }

    /// Removes an event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Sends a transmit.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn transmit(&self, receiver: &str, data: Value) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.transport.transmit(receiver, data, false)
    }

    /// Sends a transmit coalesced with the others queued in the same tick.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn transmit_batched(&self, receiver: &str, data: Value) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.transport.transmit(receiver, data, true)
    }

    /// Invokes a procedure on the client and waits for its answer.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen`, `Timeout`, or `Remote` if the client rejects.
    pub async fn invoke(&self, procedure: &str, data: Value) -> Result<Value, ServerError> {
        self.ensure_open()?;
        self.transport.invoke(procedure, data).await
    }

    /// Sends a prepared package.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn send_prepared(&self, package: &PreparedPackage) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.transport.send_prepared(package)
    }

    /// Writes out the batch buffer.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn flush_buffer(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.transport.flush_buffer()
    }

    /// Returns the number of packets in the batch buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.transport.buffer_size()
    }

    /// Returns the number of outbound bytes not yet written.
    #[must_use]
    pub fn buffered_send_amount(&self) -> usize {
        self.transport.buffered_amount()
    }

    /// Returns true while buffered bytes are at or under the low-water mark.
    #[must_use]
    pub fn has_low_send_backpressure(&self) -> bool {
        self.buffered_send_amount() <= self.server.options.low_backpressure_mark()
    }

    /// Waits until the send buffer drains to the low-water mark, or the
    /// socket closes.
    pub async fn wait_for_drain(&self) {
        let mark = self.server.options.low_backpressure_mark();
        self.transport.sink().drained_below(mark).await;
    }

    /// Signs `payload`, assigns it as the socket's token and pushes it to
    /// the client. Returns the signed token.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once closed, or an auth error if signing fails.
    pub fn authenticate(&self, payload: Claims, options: &SignOptions) -> Result<String, ServerError> {
        self.ensure_open()?;
        let (token, claims) = self.server.auth.read().sign_claims(payload, options)?;
        self.set_auth_token(Arc::new(claims), token.clone());
        self.transport.send_packet(&Packet::transmit(
            pushes::SET_AUTH_TOKEN,
            Value::String(token.clone()),
        ))?;
        Ok(token)
    }

    /// Clears the auth token and tells the client to drop it. Does nothing
    /// if the socket is not authenticated.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn deauthenticate(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        if self.clear_auth_token() {
            self.transport
                .send_packet(&Packet::transmit(pushes::REMOVE_AUTH_TOKEN, Value::Null))?;
        }
        Ok(())
    }

    /// Returns true if the token's `exp` claim is in the past.
    #[must_use]
    pub fn is_auth_token_expired(&self) -> bool {
        let auth = self.auth.lock();
        let Some(exp) = auth
            .token
            .as_ref()
            .and_then(|claims| claims.get("exp"))
            .and_then(Value::as_f64)
        else {
            return false;
        };
        Utc::now().timestamp_millis() as f64 > exp * 1000.0
    }

    /// Forcibly unsubscribes the socket from a channel and tells the client.
    /// Returns false if the socket was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn kick_out(&self, channel: &str, data: Value) -> Result<bool, ServerError> {
        self.ensure_open()?;
        if !self.unsubscribe_channel(channel) {
            return Ok(false);
        }
        self.events.emit(&SocketEvent::KickOut {
            channel: channel.to_string(),
        });
        self.transport
            .send_packet(&Packet::transmit(pushes::KICK_OUT, json!([channel, data])))?;
        Ok(true)
    }

    /// Joins a server-local group.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` once the socket is closed.
    pub fn join(self: &Arc<Self>, group: &str) -> Result<(), ServerError> {
        let mut groups = self.groups.lock();
        self.ensure_open()?;
        if !groups.iter().any(|g| g == group) {
            self.server
                .topics
                .subscribe(&group_topic(group), &self.id, TopicMember::new(self));
            groups.push(group.to_string());
        }
        Ok(())
    }

    /// Leaves a group. Returns false if the socket was not a member.
    pub fn leave(&self, group: &str) -> bool {
        let mut groups = self.groups.lock();
        let Some(index) = groups.iter().position(|g| g == group) else {
            return false;
        };
        groups.remove(index);
        self.server.topics.unsubscribe(&group_topic(group), &self.id);
        true
    }

    /// Closes the socket with a close handshake. Only the first call has an
    /// effect.
    pub fn disconnect(self: &Arc<Self>, code: u16, message: Option<&str>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.clear_buffer();
        self.transport.sink().send(Frame::Close {
            code,
            reason: message.unwrap_or_default().to_string(),
        });
        self.destroy(code, message.map(str::to_string), true);
    }

    /// Drops the connection without a close handshake or close events.
    pub(crate) fn terminate(self: &Arc<Self>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.clear_buffer();
        self.transport.sink().send(Frame::Terminate);
        self.destroy(close_codes::ABNORMAL, None, false);
    }

    /// Handles the peer closing the connection.
    pub(crate) fn handle_transport_close(self: &Arc<Self>, code: u16, reason: Option<String>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.clear_buffer();
        self.transport.sink().send(Frame::Terminate);
        self.destroy(code, reason, true);
    }

    /// Resolves once the socket has closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Returns whether the socket showed activity since the last call.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Deauthenticates the socket if its token has expired.
    pub(crate) fn check_auth_token_expiry(&self) {
        if self.is_open() && self.is_auth_token_expired() {
            debug!("Auth token of socket {} expired", self.id);
            if let Err(e) = self.deauthenticate() {
                debug!("Could not deauthenticate socket {}: {}", self.id, e);
            }
        }
    }

    /// Dispatches an inbound packet. Batches are unpacked in order.
    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: Packet, data_type: DataType) {
        let mut queue = VecDeque::from([packet]);
        while let Some(packet) = queue.pop_front() {
            if !self.is_open() {
                break;
            }
            match packet {
                Packet::Batch { packets } => {
                    for packet in packets.into_iter().rev() {
                        queue.push_front(packet);
                    }
                }
                Packet::Transmit { receiver, data } => {
                    self.handle_transmit(receiver, data, data_type).await;
                }
                Packet::Invoke {
                    id,
                    procedure,
                    data,
                } => self.handle_invoke(id, procedure, data, data_type).await,
                Packet::Response { id, data } => self.transport.resolve(id, Ok(data)),
                Packet::Reject { id, error } => {
                    self.transport.resolve(id, Err(ServerError::Remote(error)));
                }
            }
        }
    }

    /// Verifies a signed token, runs the authenticate middleware and
    /// assigns the token.
    pub(crate) async fn process_authenticate(self: &Arc<Self>, data: &Value) -> Result<(), ServerError> {
        let engine = self.server.auth.read().clone();
        let claims = match engine.verify_token(data) {
            Ok(claims) => claims,
            Err(error) => {
                if error.is_bad_auth_token() {
                    self.server.events.emit(&ServerEvent::BadSocketAuthToken {
                        socket: Arc::clone(self),
                        error: ErrorPayload::from(&error),
                    });
                }
                return Err(error);
            }
        };
        let signed = data.as_str().unwrap_or_default().to_string();

        let middleware = self.server.middlewares.read().authenticate.clone();
        if let Some(middleware) = middleware {
            let verdict = middleware.on_authenticate(self, &claims, &signed).await;
            self.settle(verdict)?;
            self.ensure_open()?;
        }

        self.set_auth_token(Arc::new(claims), signed);
        Ok(())
    }

    async fn handle_transmit(self: &Arc<Self>, receiver: String, data: Value, data_type: DataType) {
        if self.server.ignore_further_transmits.load(Ordering::Relaxed) {
            return;
        }
        self.server.counters.record_transmit();

        match receiver.as_str() {
            receivers::DEAUTHENTICATE => {
                self.clear_auth_token();
            }
            receivers::UNSUBSCRIBE => {
                if let Some(channel) = data.as_str() {
                    self.unsubscribe_channel(channel);
                }
            }
            receivers::PUBLISH => match self.process_publish(data, data_type).await {
                Ok(()) => {}
                Err(ServerError::Blocked(block)) => {
                    debug!("Publish from socket {} blocked: {}", self.id, block);
                }
                Err(error) => self.server.events.emit(&ServerEvent::Error(error)),
            },
            _ => {
                let handler = self.server.receivers.read().get(&receiver).cloned();
                match handler {
                    Some(handler) => {
                        let socket = Arc::clone(self);
                        tokio::spawn(async move { handler.receive(socket, data).await });
                    }
                    None => debug!("Socket {} sent to unknown receiver {}", self.id, receiver),
                }
            }
        }
    }

    async fn handle_invoke(self: &Arc<Self>, id: u64, procedure: String, data: Value, data_type: DataType) {
        if self.server.ignore_further_invokes.load(Ordering::Relaxed) {
            return;
        }
        self.server.counters.record_invoke();

        let result = match procedure.as_str() {
            procedures::AUTHENTICATE => self.process_authenticate(&data).await.map(|()| Value::Null),
            procedures::SUBSCRIBE => self.process_subscribe(&data).await.map(|()| Value::Null),
            procedures::PUBLISH => self
                .process_publish(data, data_type)
                .await
                .map(|()| Value::Null),
            _ => {
                let handler = self.server.procedures.read().get(&procedure).cloned();
                let Some(handler) = handler else {
                    self.respond(
                        id,
                        Err(ServerError::InvalidAction(format!(
                            "Procedure \"{procedure}\" is not registered"
                        ))),
                    );
                    return;
                };
                let socket = Arc::clone(self);
                tokio::spawn(async move {
                    let result = handler.call(Arc::clone(&socket), data).await;
                    socket.respond(id, result);
                });
                return;
            }
        };
        self.respond(id, result);
    }

    async fn process_subscribe(self: &Arc<Self>, data: &Value) -> Result<(), ServerError> {
        let Some(channel) = data.as_str() else {
            return Err(ServerError::InvalidArguments(format!(
                "Socket {} provided a malformatted channel payload",
                self.id
            )));
        };

        if !self.is_subscribed(channel) {
            self.check_channel_limit(self.subscription_count())?;
        }

        let middleware = self.server.middlewares.read().subscribe.clone();
        if let Some(middleware) = middleware {
            let verdict = middleware.on_subscribe(self, channel).await;
            self.settle(verdict)?;
        }

        self.subscribe_channel(channel).map(|_| ())
    }

    async fn process_publish(self: &Arc<Self>, data: Value, data_type: DataType) -> Result<(), ServerError> {
        if !self.server.options.allow_client_publish {
            return Err(ServerError::InvalidAction(
                "Client publish feature is disabled".to_string(),
            ));
        }
        let Some((channel, payload)) = parse_publish(data) else {
            return Err(ServerError::InvalidArguments(format!(
                "Socket {} provided a malformatted publish payload",
                self.id
            )));
        };

        let middleware = self.server.middlewares.read().publish_in.clone();
        if let Some(middleware) = middleware {
            let verdict = middleware.on_publish_in(self, &channel, &payload).await;
            self.settle(verdict)?;
            self.ensure_open()?;
        }

        self.server
            .broker
            .publish(&channel, payload, data_type.is_complex(), Some(self.as_ref()))
    }

    /// Adds a channel subscription. Returns false if already subscribed.
    fn subscribe_channel(self: &Arc<Self>, channel: &str) -> Result<bool, ServerError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            self.ensure_open()?;
            if subscriptions.iter().any(|c| c == channel) {
                return Ok(false);
            }
            self.check_channel_limit(subscriptions.len())?;
            self.server.broker.socket_subscribe(self, channel);
            subscriptions.push(channel.to_string());
        }

        debug!("Socket {} subscribed to channel {}", self.id, channel);
        self.events.emit(&SocketEvent::Subscribe {
            channel: channel.to_string(),
        });
        Ok(true)
    }

    /// Removes a channel subscription. Returns false if not subscribed.
    fn unsubscribe_channel(&self, channel: &str) -> bool {
        {
            let mut subscriptions = self.subscriptions.lock();
            let Some(index) = subscriptions.iter().position(|c| c == channel) else {
                return false;
            };
            subscriptions.remove(index);
            self.server.broker.socket_unsubscribe(&self.id, channel);
        }

        debug!("Socket {} unsubscribed from channel {}", self.id, channel);
        self.events.emit(&SocketEvent::Unsubscribe {
            channel: channel.to_string(),
        });
        true
    }

    fn check_channel_limit(&self, count: usize) -> Result<(), ServerError> {
        match self.server.options.socket_channel_limit {
            Some(limit) if count >= limit => Err(ServerError::InvalidAction(format!(
                "Socket {} tried to exceed the channel subscription limit of {}",
                self.id, limit
            ))),
            _ => Ok(()),
        }
    }

    fn set_auth_token(&self, claims: Arc<Claims>, signed: String) {
        let (was_authenticated, changed) = {
            let mut auth = self.auth.lock();
            let was_authenticated = auth.token.is_some();
            let changed = auth.signed.as_deref() != Some(signed.as_str());
            auth.token = Some(claims);
            auth.signed = Some(signed.clone());
            (was_authenticated, changed)
        };

        if changed {
            self.events.emit(&SocketEvent::Authenticate {
                signed_token: signed,
            });
        }
        if !was_authenticated {
            self.events
                .emit(&SocketEvent::AuthStateChange { authenticated: true });
        }
    }

    /// Clears the auth state. Returns false if there was nothing to clear.
    fn clear_auth_token(&self) -> bool {
        let was_authenticated = {
            let mut auth = self.auth.lock();
            auth.signed = None;
            auth.token.take().is_some()
        };

        if was_authenticated {
            self.events.emit(&SocketEvent::Deauthenticate);
            self.events
                .emit(&SocketEvent::AuthStateChange { authenticated: false });
        }
        was_authenticated
    }

    fn settle(&self, verdict: Verdict) -> Result<(), ServerError> {
        match verdict {
            Verdict::Allow => Ok(()),
            Verdict::Block(block) => Err(ServerError::Blocked(block)),
            Verdict::Fault(e) => {
                self.server
                    .events
                    .emit(&ServerEvent::Error(ServerError::Internal(e)));
                Err(ServerError::Blocked(Block::default()))
            }
        }
    }

    fn respond(&self, id: u64, result: Result<Value, ServerError>) {
        let packet = match result {
            Ok(data) => Packet::response(id, data),
            Err(error) => {
                let payload = ErrorPayload::from(&error);
                if matches!(error, ServerError::Internal(_)) {
                    self.server.events.emit(&ServerEvent::Error(error));
                }
                Packet::reject(id, payload)
            }
        };
        if let Err(e) = self.transport.send_packet(&packet) {
            debug!("Could not answer invoke {} on socket {}: {}", id, self.id, e);
        }
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ServerError::NotOpen)
        }
    }

    fn destroy(self: &Arc<Self>, code: u16, message: Option<String>, graceful: bool) {
        self.closed.send_replace(true);
        self.transport.reject_pending();

        let channels = {
            let mut subscriptions = self.subscriptions.lock();
            let channels = std::mem::take(&mut *subscriptions);
            for channel in &channels {
                self.server.broker.socket_unsubscribe(&self.id, channel);
            }
            channels
        };
        for group in std::mem::take(&mut *self.groups.lock()) {
            self.server.topics.unsubscribe(&group_topic(&group), &self.id);
        }
        self.server.topics.unsubscribe(PING_TOPIC, &self.id);

        for channel in channels {
            self.events.emit(&SocketEvent::Unsubscribe { channel });
        }

        if graceful {
            self.events.emit(&SocketEvent::Disconnect {
                code,
                message: message.clone(),
            });
            self.server.events.emit(&ServerEvent::Disconnection {
                socket: Arc::clone(self),
                code,
                message: message.clone(),
            });
            if !close_codes::is_ignored(code) {
                let message =
                    message.unwrap_or_else(|| close_codes::describe(code).to_string());
                self.events
                    .emit(&SocketEvent::Error(ServerError::Protocol { code, message }));
            }
        }

        self.events.off_all();
        self.server.remove_client(&self.id);
        debug!("Socket {} closed with code {}", self.id, code);
    }
}

fn resolve_remote_address(request: &UpgradeRequest) -> Option<String> {
    request
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| request.remote.map(|addr| addr.ip().to_string()))
}

fn parse_publish(data: Value) -> Option<(String, Value)> {
    let Value::Array(items) = data else {
        return None;
    };
    let mut items = items.into_iter();
    match (items.next(), items.next(), items.next()) {
        (Some(Value::String(channel)), payload, None) => {
            Some((channel, payload.unwrap_or(Value::Null)))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AuthOptions, ServerOptions};
    use crate::middleware::{
        AuthenticateMiddleware, PublishInMiddleware, PublishOutMiddleware, SubscribeMiddleware,
    };
    use crate::server::Server;
    use crate::ws::transport::{frame_channel, FrameQueue};
    use async_trait::async_trait;

    pub(crate) fn server(options: ServerOptions) -> Server {
        Server::new(options.with_auth(AuthOptions::with_secret("test-secret"))).expect("server")
    }

    pub(crate) fn connect(server: &Server) -> (Arc<Socket>, FrameQueue) {
        connect_with(server, UpgradeRequest::default())
    }

    pub(crate) fn connect_with(server: &Server, request: UpgradeRequest) -> (Arc<Socket>, FrameQueue) {
        let (sink, queue) = frame_channel();
        let socket = Socket::new(Arc::clone(&server.shared), request, sink);
        server.shared.register(&socket);
        (socket, queue)
    }

    pub(crate) fn next_packet(queue: &mut FrameQueue) -> Option<Packet> {
        loop {
            match queue.try_recv()? {
                Frame::Text(text) => return serde_json::from_str(text.as_str()).ok(),
                _ => continue,
            }
        }
    }

    /// Waits for the next packet, for deliveries made from spawned tasks.
    async fn recv_packet(queue: &mut FrameQueue) -> Option<Packet> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(1), queue.recv())
                .await
                .ok()??;
            if let Frame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).ok();
            }
        }
    }

    fn collect_errors(server: &Server) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        server.on(move |event| {
            if let ServerEvent::Error(e) = event {
                seen.lock().push(e.to_string());
            }
        });
        errors
    }

    async fn invoke(socket: &Arc<Socket>, id: u64, procedure: &str, data: Value) {
        socket
            .handle_packet(Packet::invoke(id, procedure, data), DataType::Json)
            .await;
    }

    struct DenyAdmin;

    #[async_trait]
    impl SubscribeMiddleware for DenyAdmin {
        async fn on_subscribe(&self, _socket: &Arc<Socket>, channel: &str) -> Verdict {
            if channel == "admin" {
                Verdict::block(4001, "denied")
            } else {
                Verdict::Allow
            }
        }
    }

    struct Faulty;

    #[async_trait]
    impl SubscribeMiddleware for Faulty {
        async fn on_subscribe(&self, _socket: &Arc<Socket>, _channel: &str) -> Verdict {
            Verdict::Fault(anyhow::anyhow!("lookup failed: secret internals"))
        }
    }

    #[tokio::test]
    async fn test_subscribe_acks_and_registers() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room1")).await;
        assert_eq!(next_packet(&mut queue), Some(Packet::response(1, Value::Null)));
        assert_eq!(socket.subscriptions(), vec!["room1"]);
        assert_eq!(server.shared.broker.get_subscriptions(), vec!["room1"]);
    }

    #[tokio::test]
    async fn test_resubscribe_is_idempotent() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room1")).await;
        invoke(&socket, 2, procedures::SUBSCRIBE, json!("room1")).await;

        assert_eq!(next_packet(&mut queue), Some(Packet::response(1, Value::Null)));
        assert_eq!(next_packet(&mut queue), Some(Packet::response(2, Value::Null)));
        assert_eq!(socket.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_non_string() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!(42)).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { id, error }) => {
                assert_eq!(id, 1);
                assert_eq!(error.name, "InvalidArgumentsError");
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(socket.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_limit() {
        let server = server(ServerOptions::default().with_socket_channel_limit(Some(2)));
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!("a")).await;
        invoke(&socket, 2, procedures::SUBSCRIBE, json!("b")).await;
        invoke(&socket, 3, procedures::SUBSCRIBE, json!("c")).await;

        next_packet(&mut queue);
        next_packet(&mut queue);
        match next_packet(&mut queue) {
            Some(Packet::Reject { id, error }) => {
                assert_eq!(id, 3);
                assert_eq!(error.name, "InvalidActionError");
                assert!(error.message.contains("limit of 2"));
                assert!(error.message.contains(socket.id()));
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(socket.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_middleware_block() {
        let server = server(ServerOptions::default());
        server.set_subscribe_middleware(Arc::new(DenyAdmin));
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!("admin")).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { error, .. }) => {
                assert_eq!(error.code, Some(4001));
                assert_eq!(error.message, "denied");
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(!socket.is_subscribed("admin"));

        invoke(&socket, 2, procedures::SUBSCRIBE, json!("lobby")).await;
        assert_eq!(next_packet(&mut queue), Some(Packet::response(2, Value::Null)));
    }

    #[tokio::test]
    async fn test_subscribe_middleware_fault_is_generic() {
        let server = server(ServerOptions::default());
        server.set_subscribe_middleware(Arc::new(Faulty));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        server.on(move |event| {
            if let ServerEvent::Error(e) = event {
                seen.lock().push(e.to_string());
            }
        });
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { error, .. }) => {
                assert_eq!(error.code, Some(4403));
                assert!(!error.message.contains("secret internals"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock().iter().any(|e| e.contains("secret internals")));
    }

    #[tokio::test]
    async fn test_unsubscribe_receiver() {
        let server = server(ServerOptions::default());
        let (socket, _queue) = connect(&server);
        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;

        socket
            .handle_packet(Packet::transmit(receivers::UNSUBSCRIBE, json!(7)), DataType::Json)
            .await;
        assert!(socket.is_subscribed("room"));

        socket
            .handle_packet(
                Packet::transmit(receivers::UNSUBSCRIBE, json!("room")),
                DataType::Json,
            )
            .await;
        assert!(!socket.is_subscribed("room"));
        assert!(server.shared.broker.get_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);
        let (other, mut other_queue) = connect(&server);
        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;
        invoke(&other, 1, procedures::SUBSCRIBE, json!("room")).await;
        next_packet(&mut queue);
        next_packet(&mut other_queue);

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        socket.on(move |event| seen.lock().push(format!("{event:?}")));

        socket.disconnect(4500, Some("bye"));
        assert!(!socket.is_open());
        assert_eq!(socket.subscription_count(), 0);
        assert_eq!(server.client_count(), 1);

        let events = events.lock().clone();
        assert!(events.iter().any(|e| e.starts_with("Unsubscribe")));
        assert!(events.iter().any(|e| e.starts_with("Disconnect")));
        assert!(events.iter().any(|e| e.starts_with("Error(Protocol")));

        server
            .exchange()
            .publish("room", json!("after"))
            .expect("publish");
        let mut frames = Vec::new();
        while let Some(frame) = queue.try_recv() {
            frames.push(frame);
        }
        assert!(matches!(frames.as_slice(), [Frame::Close { code: 4500, .. }]));
        assert!(next_packet(&mut other_queue).is_some());

        assert!(matches!(
            socket.transmit("late", Value::Null),
            Err(ServerError::NotOpen)
        ));
        assert_eq!(socket.events.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_normal_close_emits_no_protocol_error() {
        let server = server(ServerOptions::default());
        let (socket, _queue) = connect(&server);
        let errors = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&errors);
        socket.on(move |event| {
            if matches!(event, SocketEvent::Error(_)) {
                *seen.lock() += 1;
            }
        });

        socket.disconnect(close_codes::NORMAL, None);
        socket.disconnect(close_codes::NORMAL, None);
        assert_eq!(*errors.lock(), 0);
    }

    #[tokio::test]
    async fn test_terminate_skips_events() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);
        let disconnections = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&disconnections);
        server.on(move |event| {
            if matches!(event, ServerEvent::Disconnection { .. }) {
                *seen.lock() += 1;
            }
        });

        socket.terminate();
        assert!(!socket.is_open());
        assert_eq!(*disconnections.lock(), 0);
        assert!(matches!(queue.try_recv(), Some(Frame::Terminate)));
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_kick_out() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);
        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;
        next_packet(&mut queue);

        assert!(socket.kick_out("room", json!("revoked")).expect("kick"));
        assert!(!socket.is_subscribed("room"));
        assert_eq!(
            next_packet(&mut queue),
            Some(Packet::transmit(pushes::KICK_OUT, json!(["room", "revoked"])))
        );
        assert!(!socket.kick_out("room", Value::Null).expect("kick"));
    }

    #[tokio::test]
    async fn test_authenticate_procedure() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);
        let token = server
            .auth_engine()
            .sign_token(Claims::new(), &SignOptions::default())
            .expect("sign");

        invoke(&socket, 1, procedures::AUTHENTICATE, json!(token)).await;
        assert_eq!(next_packet(&mut queue), Some(Packet::response(1, Value::Null)));
        assert!(socket.is_authenticated());
        assert_eq!(socket.signed_auth_token(), Some(token));
    }

    #[tokio::test]
    async fn test_bad_token_is_flagged() {
        let server = server(ServerOptions::default());
        let bad_tokens = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&bad_tokens);
        server.on(move |event| {
            if matches!(event, ServerEvent::BadSocketAuthToken { .. }) {
                *seen.lock() += 1;
            }
        });
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::AUTHENTICATE, json!("garbage")).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { error, .. }) => assert!(error.bad_auth_token),
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(!socket.is_authenticated());
        assert_eq!(*bad_tokens.lock(), 1);
    }

    #[tokio::test]
    async fn test_server_authenticate_and_deauthenticate() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        let mut claims = Claims::new();
        claims.insert("username".to_string(), json!("bob"));
        let token = socket
            .authenticate(claims, &SignOptions::default())
            .expect("authenticate");
        assert_eq!(
            next_packet(&mut queue),
            Some(Packet::transmit(pushes::SET_AUTH_TOKEN, json!(token)))
        );
        assert_eq!(
            socket.auth_token().and_then(|c| c.get("username").cloned()),
            Some(json!("bob"))
        );

        socket.deauthenticate().expect("deauthenticate");
        assert_eq!(
            next_packet(&mut queue),
            Some(Packet::transmit(pushes::REMOVE_AUTH_TOKEN, Value::Null))
        );

        socket.deauthenticate().expect("deauthenticate");
        assert!(next_packet(&mut queue).is_none());
    }

    #[tokio::test]
    async fn test_expiry_check_deauthenticates() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        let mut claims = Claims::new();
        claims.insert("exp".to_string(), json!(Utc::now().timestamp() - 1));
        socket
            .authenticate(claims, &SignOptions::default())
            .expect("authenticate");
        next_packet(&mut queue);
        assert!(socket.is_auth_token_expired());

        socket.check_auth_token_expiry();
        assert!(!socket.is_authenticated());
        assert!(socket.is_open());
        assert_eq!(
            next_packet(&mut queue),
            Some(Packet::transmit(pushes::REMOVE_AUTH_TOKEN, Value::Null))
        );
    }

    #[tokio::test]
    async fn test_client_publish_and_publish_to_publisher() {
        for publish_to_publisher in [true, false] {
            let server = server(
                ServerOptions::default().with_publish_to_publisher(publish_to_publisher),
            );
            let (socket, mut queue) = connect(&server);
            invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;
            next_packet(&mut queue);

            invoke(&socket, 2, procedures::PUBLISH, json!(["room", {"msg": "hi"}])).await;

            let mut packets = Vec::new();
            while let Some(packet) = next_packet(&mut queue) {
                packets.push(packet);
            }
            let echoed = packets.contains(&Packet::transmit(
                pushes::PUBLISH,
                json!(["room", {"msg": "hi"}]),
            ));
            assert_eq!(echoed, publish_to_publisher);
            assert!(packets.contains(&Packet::response(2, Value::Null)));
        }
    }

    #[tokio::test]
    async fn test_client_publish_disabled() {
        let server = server(ServerOptions::default().with_allow_client_publish(false));
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 1, procedures::PUBLISH, json!(["room", 1])).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { error, .. }) => assert_eq!(error.name, "InvalidActionError"),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_procedure_rejected() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        invoke(&socket, 9, "missing", Value::Null).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { id, error }) => {
                assert_eq!(id, 9);
                assert!(error.message.contains("missing"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_packets_processed_in_order() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        socket
            .handle_packet(
                Packet::Batch {
                    packets: vec![
                        Packet::invoke(1, procedures::SUBSCRIBE, json!("a")),
                        Packet::transmit(receivers::UNSUBSCRIBE, json!("a")),
                        Packet::invoke(2, procedures::SUBSCRIBE, json!("b")),
                    ],
                },
                DataType::Json,
            )
            .await;

        assert_eq!(next_packet(&mut queue), Some(Packet::response(1, Value::Null)));
        assert_eq!(next_packet(&mut queue), Some(Packet::response(2, Value::Null)));
        assert_eq!(socket.subscriptions(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_invoke_resolved_by_client_response() {
        let server = server(ServerOptions::default());
        let (socket, mut queue) = connect(&server);

        let caller = Arc::clone(&socket);
        let call = tokio::spawn(async move { caller.invoke("whoami", Value::Null).await });
        let id = loop {
            if let Some(Packet::Invoke { id, .. }) = next_packet(&mut queue) {
                break id;
            }
            tokio::task::yield_now().await;
        };

        socket
            .handle_packet(Packet::response(id, json!("client-1")), DataType::Json)
            .await;
        assert_eq!(call.await.expect("join").expect("invoke"), json!("client-1"));
    }

    #[tokio::test]
    async fn test_remote_address_prefers_forwarded_for() {
        let server = server(ServerOptions::default());
        let mut request = UpgradeRequest {
            remote: Some("10.0.0.1:5555".parse().expect("addr")),
            ..Default::default()
        };
        request.headers.insert(
            "x-forwarded-for",
            "2001:db8::1, 10.0.0.2".parse().expect("header"),
        );
        let (socket, _queue) = connect_with(&server, request);

        assert_eq!(socket.remote_address(), Some("2001:db8::1"));
        assert_eq!(socket.remote_family(), Some(6));
        assert_eq!(socket.remote_port(), Some(5555));

        let (plain, _queue) = connect_with(
            &server,
            UpgradeRequest {
                remote: Some("10.0.0.1:5555".parse().expect("addr")),
                ..Default::default()
            },
        );
        assert_eq!(plain.remote_address(), Some("10.0.0.1"));
        assert_eq!(plain.remote_family(), Some(4));
    }

    #[tokio::test]
    async fn test_backpressure_query() {
        let server = server(ServerOptions::default().with_backpressure(64, 0.5));
        let (socket, mut queue) = connect(&server);
        assert!(socket.has_low_send_backpressure());

        socket
            .transmit("bulk", json!("x".repeat(100)))
            .expect("transmit");
        assert!(!socket.has_low_send_backpressure());

        queue.try_recv().expect("frame");
        assert!(socket.has_low_send_backpressure());
        socket.wait_for_drain().await;
    }

    /// Allows one socket, blocks another and fails for everyone else.
    struct PerSocketGate {
        allowed: String,
        blocked: String,
    }

    #[async_trait]
    impl PublishOutMiddleware for PerSocketGate {
        async fn on_publish_out(
            &self,
            socket: &Arc<Socket>,
            _channel: &str,
            _data: &Value,
        ) -> Verdict {
            if socket.id() == self.allowed {
                Verdict::Allow
            } else if socket.id() == self.blocked {
                Verdict::block(4005, "not for you")
            } else {
                Verdict::Fault(anyhow::anyhow!("gate unavailable"))
            }
        }
    }

    struct AllowAll;

    #[async_trait]
    impl PublishOutMiddleware for AllowAll {
        async fn on_publish_out(
            &self,
            _socket: &Arc<Socket>,
            _channel: &str,
            _data: &Value,
        ) -> Verdict {
            Verdict::Allow
        }
    }

    #[tokio::test]
    async fn test_publish_out_middleware_gates_each_recipient() {
        let server = server(ServerOptions::default());
        let errors = collect_errors(&server);
        let (a, mut qa) = connect(&server);
        let (b, mut qb) = connect(&server);
        let (c, mut qc) = connect(&server);
        for (socket, queue) in [(&a, &mut qa), (&b, &mut qb), (&c, &mut qc)] {
            invoke(socket, 1, procedures::SUBSCRIBE, json!("room")).await;
            next_packet(queue);
        }
        server.set_publish_out_middleware(Arc::new(PerSocketGate {
            allowed: a.id().to_string(),
            blocked: b.id().to_string(),
        }));

        server
            .exchange()
            .publish("room", json!("news"))
            .expect("publish");

        assert_eq!(
            recv_packet(&mut qa).await,
            Some(Packet::transmit(pushes::PUBLISH, json!(["room", "news"])))
        );
        tokio::task::yield_now().await;
        assert!(next_packet(&mut qb).is_none());
        assert!(next_packet(&mut qc).is_none());
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("gate unavailable"));
        assert!(b.is_open());
        assert!(c.is_open());
    }

    #[tokio::test]
    async fn test_publish_out_middleware_keeps_publisher_excluded() {
        let server = server(ServerOptions::default().with_publish_to_publisher(false));
        server.set_publish_out_middleware(Arc::new(AllowAll));
        let (a, mut qa) = connect(&server);
        let (b, mut qb) = connect(&server);
        for (socket, queue) in [(&a, &mut qa), (&b, &mut qb)] {
            invoke(socket, 1, procedures::SUBSCRIBE, json!("room")).await;
            next_packet(queue);
        }

        invoke(&a, 2, procedures::PUBLISH, json!(["room", 7])).await;

        assert_eq!(
            recv_packet(&mut qb).await,
            Some(Packet::transmit(pushes::PUBLISH, json!(["room", 7])))
        );
        assert_eq!(next_packet(&mut qa), Some(Packet::response(2, Value::Null)));
        tokio::task::yield_now().await;
        assert!(next_packet(&mut qa).is_none());
    }

    /// Blocks publishes to `quiet` and fails on `broken`.
    struct PublishRules;

    #[async_trait]
    impl PublishInMiddleware for PublishRules {
        async fn on_publish_in(
            &self,
            _socket: &Arc<Socket>,
            channel: &str,
            _data: &Value,
        ) -> Verdict {
            match channel {
                "quiet" => Verdict::block(4290, "too fast"),
                "broken" => Verdict::Fault(anyhow::anyhow!("rate store down: host db-7")),
                _ => Verdict::Allow,
            }
        }
    }

    #[tokio::test]
    async fn test_publish_in_middleware_block_and_fault() {
        let server = server(ServerOptions::default());
        server.set_publish_in_middleware(Arc::new(PublishRules));
        let errors = collect_errors(&server);
        let (publisher, mut queue) = connect(&server);
        let (listener, mut listener_queue) = connect(&server);
        for channel in ["quiet", "broken"] {
            invoke(&listener, 1, procedures::SUBSCRIBE, json!(channel)).await;
            next_packet(&mut listener_queue);
        }

        invoke(&publisher, 1, procedures::PUBLISH, json!(["quiet", 1])).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { id, error }) => {
                assert_eq!(id, 1);
                assert_eq!(error.code, Some(4290));
                assert_eq!(error.message, "too fast");
            }
            other => panic!("expected reject, got {other:?}"),
        }

        invoke(&publisher, 2, procedures::PUBLISH, json!(["broken", 2])).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { id, error }) => {
                assert_eq!(id, 2);
                assert_eq!(error.code, Some(close_codes::BLOCKED));
                assert!(!error.message.contains("db-7"));
            }
            other => panic!("expected reject, got {other:?}"),
        }

        assert!(next_packet(&mut listener_queue).is_none());
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("db-7"));

        invoke(&publisher, 3, procedures::PUBLISH, json!(["open", 3])).await;
        assert_eq!(next_packet(&mut queue), Some(Packet::response(3, Value::Null)));
    }

    struct NoLogins;

    #[async_trait]
    impl AuthenticateMiddleware for NoLogins {
        async fn on_authenticate(
            &self,
            _socket: &Arc<Socket>,
            _claims: &Claims,
            _signed_token: &str,
        ) -> Verdict {
            Verdict::block(4008, "logins closed")
        }
    }

    #[tokio::test]
    async fn test_authenticate_middleware_block() {
        let server = server(ServerOptions::default());
        server.set_authenticate_middleware(Arc::new(NoLogins));
        let changes = Arc::new(Mutex::new(0));
        let (socket, mut queue) = connect(&server);
        let seen = Arc::clone(&changes);
        socket.on(move |event| {
            if matches!(event, SocketEvent::AuthStateChange { .. }) {
                *seen.lock() += 1;
            }
        });
        let token = server
            .auth_engine()
            .sign_token(Claims::new(), &SignOptions::default())
            .expect("sign");

        invoke(&socket, 1, procedures::AUTHENTICATE, json!(token)).await;
        match next_packet(&mut queue) {
            Some(Packet::Reject { error, .. }) => {
                assert_eq!(error.code, Some(4008));
                assert_eq!(error.message, "logins closed");
                assert!(!error.bad_auth_token);
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(!socket.is_authenticated());
        assert!(socket.signed_auth_token().is_none());
        assert_eq!(*changes.lock(), 0);
        assert!(socket.is_open());
    }

    #[tokio::test]
    async fn test_backpressured_subscriber_skipped_and_counted() {
        let server = server(ServerOptions::default().with_backpressure(64, 0.5));
        let (socket, mut queue) = connect(&server);
        invoke(&socket, 1, procedures::SUBSCRIBE, json!("room")).await;
        next_packet(&mut queue);

        socket
            .transmit("bulk", json!("x".repeat(100)))
            .expect("transmit");
        server
            .exchange()
            .publish("room", json!("dropped"))
            .expect("publish");
        assert_eq!(server.counters().skipped_deliveries(), 1);

        next_packet(&mut queue);
        assert!(next_packet(&mut queue).is_none());
        server
            .exchange()
            .publish("room", json!("kept"))
            .expect("publish");
        assert_eq!(
            next_packet(&mut queue),
            Some(Packet::transmit(pushes::PUBLISH, json!(["room", "kept"])))
        );
        assert_eq!(server.counters().skipped_deliveries(), 1);
    }
}
