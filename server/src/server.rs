//! Socket server.
//!
//! Owns the client registry, the broker and the topic registry, runs the
//! admission flow for new sockets and the background ping and auth expiry
//! loops, and exposes the axum router serving the upgrade and health
//! routes.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::AuthEngine;
use crate::broker::{ChannelExchange, ExternalBrokerClient, InternalBroker};
use crate::config::{AuthOptions, ServerOptions};
use crate::emitter::{EventEmitter, ListenerId};
use crate::error::{close_codes, ErrorPayload, ServerError};
use crate::group::{GroupTransmitOptions, Groups};
use crate::hooks::{AlwaysHealthy, ConnectionHandler, HealthCheck, Procedure, Receiver};
use crate::metrics::ServerCounters;
use crate::middleware::{
    AuthenticateMiddleware, Middlewares, PublishInMiddleware, PublishOutMiddleware,
    SocketMiddleware, SubscribeMiddleware, UpgradeMiddleware, Verdict,
};
use crate::origins::OriginsChecker;
use crate::ws::handler::{fallback_handler, health_handler, upgrade_handler};
use crate::ws::messages::{auth_token_state, is_reserved, pushes, Packet, ReadyPayload};
use crate::ws::socket::Socket;
use crate::ws::topics::{TopicMember, Topics, PING_TOPIC};
use crate::ws::transport::Frame;

/// Events emitted by the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A socket completed admission.
    Connection {
        /// The new socket.
        socket: Arc<Socket>,
    },
    /// A socket closed.
    Disconnection {
        /// The closed socket.
        socket: Arc<Socket>,
        /// Close code.
        code: u16,
        /// Close reason.
        message: Option<String>,
    },
    /// Fault inside a hook, a background task or the transport.
    Error(ServerError),
    /// Non-fatal problem, such as a rejected origin.
    Warning(ServerError),
    /// A socket presented a token that failed verification.
    BadSocketAuthToken {
        /// The socket.
        socket: Arc<Socket>,
        /// The verification error as the client sees it.
        error: ErrorPayload,
    },
    /// The server started listening.
    Listening {
        /// Bound address.
        address: SocketAddr,
    },
}

/// State shared by the server handle, its sockets and its HTTP handlers.
pub(crate) struct ServerShared {
    pub(crate) options: ServerOptions,
    pub(crate) auth: RwLock<AuthEngine>,
    pub(crate) origins: OriginsChecker,
    pub(crate) clients: RwLock<HashMap<String, Arc<Socket>>>,
    pub(crate) topics: Arc<Topics>,
    pub(crate) broker: Arc<InternalBroker>,
    pub(crate) groups: Arc<Groups>,
    pub(crate) middlewares: Arc<RwLock<Middlewares>>,
    pub(crate) events: Arc<EventEmitter<ServerEvent>>,
    pub(crate) counters: Arc<ServerCounters>,
    pub(crate) procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
    pub(crate) receivers: RwLock<HashMap<String, Arc<dyn Receiver>>>,
    pub(crate) connection_handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    pub(crate) health_check: RwLock<Arc<dyn HealthCheck>>,
    pub(crate) refuse_connections: AtomicBool,
    pub(crate) ignore_further_invokes: AtomicBool,
    pub(crate) ignore_further_transmits: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl ServerShared {
    /// Adds a freshly constructed socket to the registry and the ping topic.
    pub(crate) fn register(&self, socket: &Arc<Socket>) {
        self.clients
            .write()
            .insert(socket.id().to_string(), Arc::clone(socket));
        self.topics
            .subscribe(PING_TOPIC, socket.id(), TopicMember::new(socket));
        self.counters.record_connection_opened();
    }

    pub(crate) fn remove_client(&self, id: &str) {
        if self.clients.write().remove(id).is_some() {
            self.counters.record_connection_closed();
        }
    }

    pub(crate) fn is_refusing_connections(&self) -> bool {
        self.refuse_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn clients(&self) -> Vec<Arc<Socket>> {
        self.clients.read().values().cloned().collect()
    }

    pub(crate) async fn check_health(&self) -> bool {
        let check = Arc::clone(&*self.health_check.read());
        match check.check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                error!("Health check failed: {}", e);
                self.events
                    .emit(&ServerEvent::Error(ServerError::Internal(e)));
                false
            }
        }
    }

    /// Runs the admission flow of a socket up to the ready signal.
    pub(crate) async fn admit(self: Arc<Self>, socket: Arc<Socket>) {
        if let Err(e) = self.try_admit(&socket).await {
            error!("Failed to admit socket {}: {}", socket.id(), e);
            self.events.emit(&ServerEvent::Error(e));
            socket.disconnect(close_codes::SERVER_ERROR, Some("Unknown connection error"));
        }
    }

    async fn try_admit(&self, socket: &Arc<Socket>) -> Result<(), ServerError> {
        let middleware = self.middlewares.read().socket.clone();
        if let Some(middleware) = middleware {
            match middleware.on_socket(socket).await {
                Verdict::Allow => {}
                Verdict::Block(block) => {
                    debug!("Socket {} blocked: {}", socket.id(), block);
                    let message = block
                        .message
                        .as_deref()
                        .unwrap_or("Connection was blocked by socket middleware");
                    socket.disconnect(block.code, Some(message));
                    return Ok(());
                }
                Verdict::Fault(e) => {
                    self.events
                        .emit(&ServerEvent::Error(ServerError::Internal(e)));
                    socket.disconnect(
                        close_codes::BLOCKED,
                        Some("Connection was blocked by socket middleware"),
                    );
                    return Ok(());
                }
            }
        }
        if !socket.is_open() {
            return Ok(());
        }

        let token_state = match socket.request().signed_token.clone() {
            None => auth_token_state::OK,
            Some(token) => match socket.process_authenticate(&Value::String(token)).await {
                Ok(()) => auth_token_state::OK,
                Err(e) if e.is_bad_auth_token() => auth_token_state::BAD_TOKEN,
                Err(e) => {
                    debug!("Handshake token of socket {} not applied: {}", socket.id(), e);
                    auth_token_state::FAILED
                }
            },
        };
        if !socket.is_open() {
            return Ok(());
        }

        let handler = self.connection_handler.read().clone();
        let ready_data = match handler {
            Some(handler) => handler.on_connection(socket).await?,
            None => None,
        };
        if !socket.is_open() {
            return Ok(());
        }

        let ready = ReadyPayload {
            id: socket.id().to_string(),
            ping_interval: self.options.ping_interval_ms,
            max_payload: self.options.max_payload,
            auth_token_state: token_state,
            ready_data,
        };
        socket
            .transport()
            .send_packet(&Packet::transmit(pushes::READY, serde_json::to_value(&ready)?))?;

        debug!("Socket {} admitted", socket.id());
        self.events.emit(&ServerEvent::Connection {
            socket: Arc::clone(socket),
        });
        Ok(())
    }

    /// Disconnects sockets that stayed silent since the last round, then
    /// pings everyone else.
    pub(crate) fn ping_clients(&self) {
        for socket in self.clients() {
            if !socket.take_alive() {
                warn!("Socket {} timed out", socket.id());
                socket.disconnect(close_codes::PING_TIMEOUT, Some("Ping timeout"));
            }
        }
        self.topics.publish(PING_TOPIC, &Frame::Ping, None);
    }

    pub(crate) fn check_auth_expiry(&self) {
        for socket in self.clients() {
            socket.check_auth_token_expiry();
        }
    }
}

/// Handle to a socket server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    pub(crate) shared: Arc<ServerShared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.shared.options.id)
            .field("path", &self.shared.options.path)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server from validated options.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the options are invalid.
    pub fn new(options: ServerOptions) -> Result<Self, ServerError> {
        let options = options.normalized();
        options.validate()?;

        let auth = AuthEngine::new(options.auth.clone())?;
        let counters = Arc::new(ServerCounters::new());
        let topics = Arc::new(
            Topics::new(options.max_backpressure).with_counters(Arc::clone(&counters)),
        );
        let middlewares = Arc::new(RwLock::new(Middlewares::default()));
        let events = Arc::new(EventEmitter::new());
        let broker = Arc::new(InternalBroker::new(
            Arc::clone(&topics),
            options.publish_to_publisher,
            Arc::clone(&middlewares),
            Arc::clone(&events),
        ));
        let groups = Arc::new(Groups::new(Arc::clone(&topics)));
        let origins = OriginsChecker::new(options.origins.as_deref());

        Ok(Self {
            shared: Arc::new(ServerShared {
                options,
                auth: RwLock::new(auth),
                origins,
                clients: RwLock::new(HashMap::new()),
                topics,
                broker,
                groups,
                middlewares,
                events,
                counters,
                procedures: RwLock::new(HashMap::new()),
                receivers: RwLock::new(HashMap::new()),
                connection_handler: RwLock::new(None),
                health_check: RwLock::new(Arc::new(AlwaysHealthy)),
                refuse_connections: AtomicBool::new(false),
                ignore_further_invokes: AtomicBool::new(false),
                ignore_further_transmits: AtomicBool::new(false),
                shutdown: watch::Sender::new(false),
                tasks: Mutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the normalised options.
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    /// Returns a snapshot of the auth engine.
    #[must_use]
    pub fn auth_engine(&self) -> AuthEngine {
        self.shared.auth.read().clone()
    }

    /// Replaces the auth options and re-derives key material.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the new options are invalid. The previous
    /// options stay in effect.
    pub fn update_auth_options(&self, options: AuthOptions) -> Result<(), ServerError> {
        self.shared.auth.write().update_options(options)?;
        Ok(())
    }

    /// Replaces every middleware slot at once.
    pub fn set_middlewares(&self, middlewares: Middlewares) {
        *self.shared.middlewares.write() = middlewares;
    }

    /// Sets the upgrade middleware.
    pub fn set_upgrade_middleware(&self, middleware: Arc<dyn UpgradeMiddleware>) {
        self.shared.middlewares.write().upgrade = Some(middleware);
    }

    /// Sets the socket middleware.
    pub fn set_socket_middleware(&self, middleware: Arc<dyn SocketMiddleware>) {
        self.shared.middlewares.write().socket = Some(middleware);
    }

    /// Sets the authenticate middleware.
    pub fn set_authenticate_middleware(&self, middleware: Arc<dyn AuthenticateMiddleware>) {
        self.shared.middlewares.write().authenticate = Some(middleware);
    }

    /// Sets the subscribe middleware.
    pub fn set_subscribe_middleware(&self, middleware: Arc<dyn SubscribeMiddleware>) {
        self.shared.middlewares.write().subscribe = Some(middleware);
    }

    /// Sets the inbound publish middleware.
    pub fn set_publish_in_middleware(&self, middleware: Arc<dyn PublishInMiddleware>) {
        self.shared.middlewares.write().publish_in = Some(middleware);
    }

    /// Sets the outbound publish middleware.
    pub fn set_publish_out_middleware(&self, middleware: Arc<dyn PublishOutMiddleware>) {
        self.shared.middlewares.write().publish_out = Some(middleware);
    }

    /// Sets the handler called for every admitted connection.
    pub fn set_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.shared.connection_handler.write() = Some(handler);
    }

    /// Sets the health check behind the health endpoint.
    pub fn set_health_check(&self, check: Arc<dyn HealthCheck>) {
        *self.shared.health_check.write() = check;
    }

    /// Registers an application procedure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for names starting with `#`.
    pub fn register_procedure(
        &self,
        name: impl Into<String>,
        procedure: Arc<dyn Procedure>,
    ) -> Result<(), ServerError> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(ServerError::InvalidArguments(format!(
                "Procedure name \"{name}\" is reserved"
            )));
        }
        self.shared.procedures.write().insert(name, procedure);
        Ok(())
    }

    /// Registers an application receiver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for names starting with `#`.
    pub fn register_receiver(
        &self,
        name: impl Into<String>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<(), ServerError> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(ServerError::InvalidArguments(format!(
                "Receiver name \"{name}\" is reserved"
            )));
        }
        self.shared.receivers.write().insert(name, receiver);
        Ok(())
    }

    /// Refuses new upgrades with 503 while set.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.shared
            .refuse_connections
            .store(refuse, Ordering::Relaxed);
    }

    /// Drops inbound invokes without answering while set.
    pub fn set_ignore_further_invokes(&self, ignore: bool) {
        self.shared
            .ignore_further_invokes
            .store(ignore, Ordering::Relaxed);
    }

    /// Drops inbound transmits while set.
    pub fn set_ignore_further_transmits(&self, ignore: bool) {
        self.shared
            .ignore_further_transmits
            .store(ignore, Ordering::Relaxed);
    }

    /// Returns the channel exchange.
    #[must_use]
    pub fn exchange(&self) -> ChannelExchange {
        ChannelExchange::new(Arc::clone(&self.shared.broker))
    }

    /// Plugs in an external broker client.
    pub fn set_external_client(&self, client: Arc<dyn ExternalBrokerClient>) {
        self.shared.broker.set_external_client(client);
    }

    /// Returns the group transport.
    #[must_use]
    pub fn groups(&self) -> &Arc<Groups> {
        &self.shared.groups
    }

    /// Sends a transmit to every member of a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be serialized.
    pub fn transmit_to_group(
        &self,
        group: &str,
        receiver: &str,
        data: Value,
        options: &GroupTransmitOptions,
    ) -> Result<(), ServerError> {
        self.shared.groups.transmit(group, receiver, data, options)
    }

    /// Returns every registered socket.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Socket>> {
        self.shared.clients()
    }

    /// Looks up a socket by id.
    #[must_use]
    pub fn client(&self, id: &str) -> Option<Arc<Socket>> {
        self.shared.clients.read().get(id).cloned()
    }

    /// Returns the number of registered sockets.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    /// Returns the traffic counters.
    #[must_use]
    pub fn counters(&self) -> &ServerCounters {
        &self.shared.counters
    }

    /// Registers an event listener.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(listener)
    }

    /// Registers a listener for the next event only.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.events.once(listener)
    }

    /// Removes an event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    /// Builds the router serving the upgrade route, the health route and
    /// a 426 fallback.
    pub fn router(&self) -> Router {
        let path = &self.shared.options.path;
        let upgrade_path = if path.is_empty() { "/" } else { path.as_str() };

        let mut router = Router::new().route(upgrade_path, get(upgrade_handler));
        if self.shared.options.health_endpoint {
            router = router.route(&format!("{path}/health"), get(health_handler));
        }

        router
            .fallback(fallback_handler)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Binds `0.0.0.0:<port>` and serves until [`Server::terminate`].
    ///
    /// # Errors
    ///
    /// Returns `PortInUse` if the port is taken, `FailedToListen` otherwise.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let port = self.shared.options.port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => ServerError::PortInUse(port),
                _ => ServerError::FailedToListen(e.to_string()),
            })?;
        self.serve(listener).await
    }

    /// Serves on a bound listener until [`Server::terminate`].
    ///
    /// # Errors
    ///
    /// Returns `FailedToListen` if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let address = listener
            .local_addr()
            .map_err(|e| ServerError::FailedToListen(e.to_string()))?;
        info!("Socket server listening on {}{}", address, self.shared.options.path);
        self.start_background_tasks();
        self.shared
            .events
            .emit(&ServerEvent::Listening { address });

        let mut shutdown = self.shared.shutdown.subscribe();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| ServerError::FailedToListen(e.to_string()))
    }

    /// Stops background tasks, drops every socket and terminates the
    /// broker. Only the first call has an effect.
    pub fn terminate(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Terminating socket server");

        self.shared.shutdown.send_replace(true);
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        for socket in self.shared.clients() {
            socket.terminate();
        }
        self.shared.clients.write().clear();
        self.shared.broker.terminate();
    }

    /// Returns true once [`Server::terminate`] was called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.shared.tasks.lock();
        if !tasks.is_empty() || self.is_terminated() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let ping_interval = Duration::from_millis(shared.options.ping_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                shared.ping_clients();
            }
        }));

        let shared = Arc::clone(&self.shared);
        let expiry_interval =
            Duration::from_millis(shared.auth.read().options().expire_check_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(expiry_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                shared.check_auth_expiry();
            }
        }));

        tasks.push(tokio::spawn(
            Arc::clone(&self.shared.broker).run_external_inbound(),
        ));
    }
}
