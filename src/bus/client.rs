//! Connection engine for the TCP event bus bridge.
//!
//! [`EventBus`] owns one logical session to the bridge. While connected it
//! runs two background tasks against the live socket:
//!
//! - the read loop, which decodes frames and dispatches them to registered
//!   handlers or pending reply waiters, and
//! - the ping loop, which keeps the bridge from reaping the connection.
//!
//! Handlers and reply callbacks always run on the blocking pool, never on the
//! read loop, so slow user code cannot stall frame reception.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::envelope::{Headers, Inbound, InboundEnvelope, OutboundEnvelope};
use super::error::BusError;
use super::framing::{write_frame, FrameReader};
use super::message::{DeliveryOptions, Message, Response};
use super::registry::{Registry, Removal, ReplyCallback};
use crate::config::BusConfig;

/// Callback receiving errors discovered in the background.
pub type ErrorHandler = Arc<dyn Fn(BusError) + Send + Sync>;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One live socket. A reconnect creates a new `Link`.
struct Link {
    id: u64,
    /// Whole frames are written under this lock so concurrent callers never
    /// interleave bytes on the wire.
    writer: AsyncMutex<OwnedWriteHalf>,
    shutdown: watch::Sender<bool>,
}

impl Link {
    async fn write(&self, payload: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await
    }

    fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected(Arc<Link>),
}

struct Shared {
    config: BusConfig,
    link: Mutex<LinkState>,
    registry: Arc<Registry>,
    error_handler: RwLock<Option<ErrorHandler>>,
    next_link_id: AtomicU64,
}

impl Shared {
    fn current_link(&self) -> Option<Arc<Link>> {
        match &*self.link.lock() {
            LinkState::Connected(link) => Some(Arc::clone(link)),
            _ => None,
        }
    }

    /// Drop `link` if it is still the current one and tell its loops to stop.
    ///
    /// Returns `true` only for the caller that performed the transition, so a
    /// failure is reported once even if several tasks observe it.
    fn detach(&self, link: &Link) -> bool {
        let detached = {
            let mut state = self.link.lock();
            let is_current =
                matches!(&*state, LinkState::Connected(current) if current.id == link.id);
            if is_current {
                *state = LinkState::Disconnected;
            }
            is_current
        };
        link.signal_shutdown();
        detached
    }

    /// Serialize and write one envelope on `link`.
    ///
    /// A write failure tears the link down: the socket is in an unknown state
    /// once part of a frame may have been written.
    async fn write_on(&self, link: &Link, envelope: &OutboundEnvelope<'_>) -> Result<(), BusError> {
        let payload = envelope.to_json()?;
        match link.write(&payload).await {
            Ok(()) => {
                debug!(link = link.id, kind = envelope.kind(), "sent frame");
                Ok(())
            }
            Err(e) => {
                if self.detach(link) {
                    error!(link = link.id, kind = envelope.kind(), "write failed: {}", e);
                }
                Err(BusError::Disconnected(Some(e)))
            }
        }
    }

    fn notify_error(&self, err: BusError) {
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => {
                tokio::task::spawn_blocking(move || handler(err));
            }
            None => warn!("No error handler installed, dropping error: {}", err),
        }
    }
}

impl Drop for Shared {
    /// The last handle is gone: stop the loops so the socket closes.
    fn drop(&mut self) {
        if let LinkState::Connected(link) = self.link.get_mut() {
            link.signal_shutdown();
        }
    }
}

/// Client for the TCP event bus bridge.
///
/// Dropping the last handle closes a live connection without sending
/// `unregister` frames; call `disconnect()` first for a clean goodbye.
///
/// Cloning is cheap; all clones share the same connection and registrations.
///
/// # Connection Lifecycle
///
/// - `connect()` - Open the socket, start the read and ping loops, replay
///   registrations from an earlier session
/// - `disconnect()` - Unregister every address (best effort) and close
/// - The engine never reconnects on its own; call `connect()` again
///
/// # Example
///
/// ```ignore
/// use eventbus_bridge::bus::{DeliveryOptions, EventBus, Headers};
/// use serde_json::json;
///
/// let bus = EventBus::new("localhost", 7000);
/// bus.connect().await?;
///
/// bus.register("test.time", None, &Headers::new(), |msg| {
///     println!("now = {}", msg.body()["now"]);
/// })
/// .await?;
///
/// let response = bus
///     .request("test.echo", &json!({"foo": "bar"}), DeliveryOptions::new())
///     .await?;
/// ```
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create an unconnected client with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(BusConfig::new(host, port))
    }

    /// Create an unconnected client.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                link: Mutex::new(LinkState::Disconnected),
                registry: Arc::new(Registry::new()),
                error_handler: RwLock::new(None),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.shared.link.lock() {
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Connecting => ConnectionState::Connecting,
            LinkState::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Whether a live socket is currently held.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Install the handler for errors discovered in the background, replacing
    /// any previous one.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(BusError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_error_handler(&self) {
        *self.shared.error_handler.write() = None;
    }

    /// Addresses with at least one live registration.
    pub fn registered_addresses(&self) -> Vec<String> {
        self.shared
            .registry
            .addresses()
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.shared.registry.is_registered(address)
    }

    /// Number of handlers registered at `address`.
    pub fn registration_count(&self, address: &str) -> usize {
        self.shared.registry.registration_count(address)
    }

    /// Number of sends still waiting for a reply or a timeout.
    pub fn pending_replies(&self) -> usize {
        self.shared.registry.pending_replies()
    }

    /// Connect to the bridge.
    ///
    /// Replays a `register` frame for every address registered in an
    /// earlier session and sends one ping, then publishes the link and
    /// starts the read and ping loops. Calling it while connected is a
    /// no-op. If the returned future is dropped before it completes, the bus
    /// is left disconnected.
    ///
    /// # Errors
    ///
    /// - `BusError::Connection` if the configuration is unusable, the TCP
    ///   connection cannot be opened, or another `connect()` is in progress
    /// - `BusError::Disconnected` if the socket fails during the handshake
    pub async fn connect(&self) -> Result<(), BusError> {
        let config = &self.shared.config;
        if let Some(problem) = config.problem() {
            return Err(BusError::Connection(io::Error::new(
                io::ErrorKind::InvalidInput,
                problem,
            )));
        }

        {
            let mut state = self.shared.link.lock();
            if matches!(*state, LinkState::Connected(_)) {
                debug!("connect() called while already connected");
                return Ok(());
            }
            if matches!(*state, LinkState::Connecting) {
                return Err(BusError::Connection(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "connection attempt already in progress",
                )));
            }
            *state = LinkState::Connecting;
        }
        let guard = ConnectingGuard {
            shared: &self.shared,
            armed: true,
        };

        info!("Connecting to event bus bridge at {}:{}", config.host, config.port);

        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                error!("Failed to connect to {}:{}: {}", config.host, config.port, e);
                BusError::Connection(e)
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Arc::new(Link {
            id: self.shared.next_link_id.fetch_add(1, Ordering::Relaxed),
            writer: AsyncMutex::new(write_half),
            shutdown: shutdown_tx,
        });

        // The handshake runs while the state is still `Connecting`, so
        // register() cannot race the replay and every await happens before
        // the link is visible.
        let addresses = self.shared.registry.addresses();
        if !addresses.is_empty() {
            info!(count = addresses.len(), "Replaying registrations");
        }
        for (address, headers) in &addresses {
            let envelope = OutboundEnvelope::Register {
                address,
                headers,
            };
            self.shared.write_on(&link, &envelope).await?;
        }

        // Ping once up front so an unreachable bridge fails connect() itself.
        self.shared.write_on(&link, &OutboundEnvelope::Ping).await?;

        *self.shared.link.lock() = LinkState::Connected(Arc::clone(&link));
        guard.disarm();

        let reader = FrameReader::new(read_half, config.max_frame_size);
        tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            Arc::clone(&link),
            reader,
            shutdown_rx.clone(),
        ));
        tokio::spawn(ping_loop(
            Arc::downgrade(&self.shared),
            Arc::clone(&link),
            config.ping_interval(),
            shutdown_rx,
        ));

        info!(link = link.id, "Connected to event bus bridge");
        Ok(())
    }

    /// Close the connection.
    ///
    /// Sends an `unregister` frame for every live address first; failures of
    /// that step are ignored since the socket is going away anyway. Local
    /// registrations are kept and replayed by the next `connect()`.
    /// Calling it while disconnected is a no-op.
    pub async fn disconnect(&self) {
        let link = {
            let mut state = self.shared.link.lock();
            match std::mem::replace(&mut *state, LinkState::Disconnected) {
                LinkState::Connected(link) => link,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        for (address, headers) in self.shared.registry.addresses() {
            let envelope = OutboundEnvelope::Unregister {
                address: &address,
                headers: &headers,
            };
            let payload = match envelope.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(address = %address, "Failed to encode unregister: {}", e);
                    continue;
                }
            };
            if let Err(e) = link.write(&payload).await {
                debug!(address = %address, "Ignoring unregister failure during disconnect: {}", e);
                break;
            }
        }

        link.signal_shutdown();
        let mut writer = link.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
        info!(link = link.id, "Disconnected from event bus bridge");
    }

    /// Point-to-point send with no reply expected.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidData` if `body` cannot be serialized
    /// - `BusError::Disconnected` if not connected or the write fails
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        address: &str,
        body: &B,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        self.send_inner(address, body, options, None).await
    }

    /// Point-to-point send expecting a reply.
    ///
    /// `callback` fires exactly once: with the reply if it arrives within the
    /// reply timeout, with [`Response::TimedOut`] otherwise. If the write
    /// itself fails the error is returned and the callback still fires with a
    /// timeout later.
    pub async fn send_with_reply<B, F>(
        &self,
        address: &str,
        body: &B,
        options: DeliveryOptions,
        callback: F,
    ) -> Result<(), BusError>
    where
        B: Serialize + ?Sized,
        F: FnOnce(Response) + Send + 'static,
    {
        self.send_inner(address, body, options, Some(Box::new(callback)))
            .await
    }

    /// Send and wait for the reply (or timeout) inline.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        address: &str,
        body: &B,
        options: DeliveryOptions,
    ) -> Result<Response, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send_with_reply(address, body, options, move |response| {
            let _ = tx.send(response);
        })
        .await?;
        // The waiter always resolves, by reply or by timeout.
        rx.await.map_err(|_| BusError::Disconnected(None))
    }

    /// Broadcast to every handler registered at `address`.
    pub async fn publish<B: Serialize + ?Sized>(
        &self,
        address: &str,
        body: &B,
        headers: &Headers,
    ) -> Result<(), BusError> {
        let body = to_body(body)?;
        let link = self
            .shared
            .current_link()
            .ok_or(BusError::Disconnected(None))?;
        let envelope = OutboundEnvelope::Publish {
            address,
            body: &body,
            headers,
        };
        self.shared.write_on(&link, &envelope).await
    }

    /// Register a handler for `address`. Returns the registration id, needed
    /// to unregister this specific handler.
    ///
    /// Only the first registration for an address is announced to the
    /// bridge. An `id` already registered at the address replaces that
    /// handler.
    ///
    /// # Errors
    ///
    /// `BusError::Disconnected` if not connected (nothing is stored), or if
    /// announcing the address fails (the registration is kept and replayed on
    /// the next `connect()`).
    pub async fn register<F>(
        &self,
        address: &str,
        id: Option<&str>,
        headers: &Headers,
        handler: F,
    ) -> Result<String, BusError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let link = self
            .shared
            .current_link()
            .ok_or(BusError::Disconnected(None))?;
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let first = self
            .shared
            .registry
            .add_registration(address, &id, headers, Arc::new(handler));
        if first {
            let envelope = OutboundEnvelope::Register { address, headers };
            self.shared.write_on(&link, &envelope).await?;
        }

        debug!(address, id = %id, first, "Registered handler");
        Ok(id)
    }

    /// Remove one registration. Returns whether anything was removed.
    ///
    /// Removing the last registration for an address sends an `unregister`
    /// frame.
    ///
    /// # Errors
    ///
    /// `BusError::Disconnected` if not connected. The local registration is
    /// removed regardless, so the handler will not fire again and will not
    /// be replayed on reconnect.
    pub async fn unregister(
        &self,
        address: &str,
        id: &str,
        headers: &Headers,
    ) -> Result<bool, BusError> {
        let removal = self.shared.registry.remove_registration(address, id);
        let link = self
            .shared
            .current_link()
            .ok_or(BusError::Disconnected(None))?;

        if removal == Removal::RemovedLast {
            let envelope = OutboundEnvelope::Unregister { address, headers };
            self.shared.write_on(&link, &envelope).await?;
        }

        debug!(address, id, ?removal, "Unregistered handler");
        Ok(removal.removed())
    }

    async fn send_inner<B: Serialize + ?Sized>(
        &self,
        address: &str,
        body: &B,
        options: DeliveryOptions,
        callback: Option<ReplyCallback>,
    ) -> Result<(), BusError> {
        let body = to_body(body)?;
        let link = self
            .shared
            .current_link()
            .ok_or(BusError::Disconnected(None))?;

        let timeout = options
            .reply_timeout
            .unwrap_or_else(|| self.shared.config.reply_timeout());
        let reply_address = callback.map(|callback| {
            let reply_address = Uuid::new_v4().to_string();
            self.shared.registry.insert_waiter(&reply_address, callback);
            self.arm_reply_timeout(&reply_address, timeout);
            reply_address
        });

        let envelope = OutboundEnvelope::Send {
            address,
            body: &body,
            headers: &options.headers,
            reply_address: reply_address.as_deref(),
        };
        self.shared.write_on(&link, &envelope).await
    }

    /// Spawn the timeout half of the reply race. The timer only fires the
    /// callback if it is the one that removes the waiter.
    fn arm_reply_timeout(&self, reply_address: &str, timeout: Duration) {
        let registry = Arc::clone(&self.shared.registry);
        let key = reply_address.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(waiter) = registry.take_waiter(&key) {
                debug!(reply_address = %key, "Reply timed out");
                tokio::task::spawn_blocking(move || waiter.resolve(Response::TimedOut));
            }
        });
        self.shared
            .registry
            .attach_timer(reply_address, timer.abort_handle());
    }

    /// Route one inbound envelope. Registrations take precedence over reply
    /// waiters; anything else is ignored.
    fn dispatch(&self, address: String, envelope: InboundEnvelope) {
        let registry = &self.shared.registry;

        let handlers = registry.handlers_for(&address, envelope.send);
        if !handlers.is_empty() {
            debug!(address = %address, handlers = handlers.len(), send = envelope.send, "Dispatching message");
            let message = Message::from_envelope(address, envelope, self.clone());
            for handler in handlers {
                let message = message.clone();
                tokio::task::spawn_blocking(move || handler(message));
            }
            return;
        }

        if let Some(mut waiter) = registry.take_waiter(&address) {
            debug!(reply_address = %address, "Reply received");
            waiter.cancel_timer();
            let message = Message::from_envelope(address, envelope, self.clone());
            tokio::task::spawn_blocking(move || waiter.resolve(Response::Reply(message)));
            return;
        }

        debug!(address = %address, "No handlers for address, ignoring message");
    }
}

/// Resets `Connecting` back to `Disconnected` if `connect()` bails out or is
/// cancelled before the socket is installed.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl ConnectingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.link.lock();
            if matches!(*state, LinkState::Connecting) {
                *state = LinkState::Disconnected;
            }
        }
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, BusError> {
    serde_json::to_value(body).map_err(|e| BusError::InvalidData(e.to_string()))
}

/// Read frames until the link fails or is shut down.
///
/// The loop holds the bus weakly. Once every `EventBus` handle is gone the
/// link is signalled to shut down and the loop retires.
async fn read_loop(
    weak: Weak<Shared>,
    link: Arc<Link>,
    mut reader: FrameReader<OwnedReadHalf>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(link = link.id, "Read loop started");

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = reader.next_frame() => frame,
        };
        let Some(shared) = weak.upgrade() else {
            break;
        };

        let envelope = frame.and_then(|payload| {
            debug!(link = link.id, bytes = payload.len(), "Received frame");
            InboundEnvelope::parse(&payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        });

        match envelope.map(InboundEnvelope::classify) {
            Ok(Inbound::Delivery { address, envelope }) => {
                EventBus { shared }.dispatch(address, envelope)
            }
            Ok(Inbound::ServerError(message)) => {
                warn!(link = link.id, "Bridge reported error: {}", message);
                shared.notify_error(BusError::ServerError(message));
            }
            Ok(Inbound::Control(kind)) => {
                debug!(link = link.id, ?kind, "Ignoring control frame");
            }
            Err(e) => {
                if shared.detach(&link) {
                    error!(link = link.id, "Connection failed: {}", e);
                    shared.notify_error(BusError::Disconnected(Some(e)));
                }
                break;
            }
        }
    }

    debug!(link = link.id, "Read loop stopped");
}

/// Send a ping every `period` until the link fails or is shut down. The
/// first ping is sent by `connect()` itself.
async fn ping_loop(
    weak: Weak<Shared>,
    link: Arc<Link>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let payload = match OutboundEnvelope::Ping.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode ping: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = link.write(&payload).await {
            if let Some(shared) = weak.upgrade() {
                if shared.detach(&link) {
                    error!(link = link.id, "Ping failed: {}", e);
                    shared.notify_error(BusError::Disconnected(Some(e)));
                }
            }
            break;
        }
        debug!(link = link.id, "Sent ping");
    }

    debug!(link = link.id, "Ping loop stopped");
}
