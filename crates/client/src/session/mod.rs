// Chat session core: one multiplexed connection, one inbound stream.
//
// Serializes connection establishment under concurrent callers, dedupes
// join handshakes, owns the inbound subscription, and guarantees clean
// teardown. Transport is abstracted via `ChatTransport` for testability;
// the wire implementation lives out of tree.
//
// All operations are async and the session spawns background tasks
// (establishment driver, auto-join, send acknowledgment logging, the
// subscription pump), so a tokio runtime must be running.

pub mod decode;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use colloquy_common::protocol::message::ChatMessage;
use colloquy_common::protocol::routing::{encode_route, RouteError};

use crate::config::ClientConfig;
use crate::session::decode::{decode_payload, DecodedPayload};
use crate::transport::{ChatConnection, ChatTransport, InboundStream, UNBOUNDED_DEMAND};

/// How long `leave` waits for the server to acknowledge the leave
/// notification before teardown proceeds without it.
const LEAVE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

// ── Errors ──────────────────────────────────────────────────────────

/// Establishment failure. Clonable so every caller coalesced onto one
/// attempt observes the same error.
#[derive(Debug, Clone, Error)]
#[error("connection failed: {0}")]
pub struct ConnectError(Arc<anyhow::Error>);

impl ConnectError {
    fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

/// Failure of a join or subscribe call.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("could not encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Transport(anyhow::Error),
}

// ── Establishment coalescing ────────────────────────────────────────

type Attempt<C> = Shared<BoxFuture<'static, Result<Arc<C>, ConnectError>>>;

/// Process-scoped coalescing slot for in-flight establishment attempts.
///
/// UI frameworks re-run their setup paths; two `connect` calls in rapid
/// succession must share one physical handshake even when they arrive
/// through different session handles. Sessions given a clone of the
/// same coordinator share a single pending-attempt slot; the default is
/// one coordinator per session, which is the narrowest scope that keeps
/// the guarantee for a single-session process.
pub struct ConnectCoordinator<C> {
    pending: Arc<Mutex<Option<Attempt<C>>>>,
}

impl<C> ConnectCoordinator<C> {
    pub fn new() -> Self {
        Self { pending: Arc::new(Mutex::new(None)) }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Attempt<C>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> Option<Attempt<C>> {
        self.slot().clone()
    }

    fn store(&self, attempt: Attempt<C>) {
        *self.slot() = Some(attempt);
    }

    fn clear(&self) {
        self.slot().take();
    }
}

impl<C> Clone for ConnectCoordinator<C> {
    fn clone(&self) -> Self {
        Self { pending: Arc::clone(&self.pending) }
    }
}

impl<C> Default for ConnectCoordinator<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Subscription handle ─────────────────────────────────────────────

/// Handle to the active inbound subscription.
///
/// `cancel` is idempotent: a second call on an already-cancelled handle
/// is a no-op.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    id: u64,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Subscription {
    pub fn cancel(&self) {
        let sender = self.inner.cancel_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn id(&self) -> u64 {
        self.inner.id
    }
}

// ── Session state ───────────────────────────────────────────────────

struct SessionState<C> {
    conn: Option<Arc<C>>,
    connecting: Option<Attempt<C>>,
    joined: HashSet<String>,
    subscription: Option<Subscription>,
    /// Bumped by `disconnect`; an attempt that settles under an older
    /// generation must not resurrect state.
    generation: u64,
    next_subscription_id: u64,
}

impl<C> SessionState<C> {
    fn new() -> Self {
        Self {
            conn: None,
            connecting: None,
            joined: HashSet::new(),
            subscription: None,
            generation: 0,
            next_subscription_id: 0,
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Stateful facade over one multiplexed chat connection.
///
/// Cloning hands out another handle to the same session; all clones
/// share connection, join, and subscription state.
pub struct ChatSession<T: ChatTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    coordinator: ConnectCoordinator<T::Conn>,
    state: Arc<Mutex<SessionState<T::Conn>>>,
}

impl<T: ChatTransport> Clone for ChatSession<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            coordinator: ConnectCoordinator::new(),
            state: Arc::new(Mutex::new(SessionState::new())),
        }
    }

    /// Share an establishment-coordination slot with other sessions in
    /// this process.
    pub fn with_coordinator(mut self, coordinator: ConnectCoordinator<T::Conn>) -> Self {
        self.coordinator = coordinator;
        self
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().conn.is_some()
    }

    fn state(&self) -> MutexGuard<'_, SessionState<T::Conn>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establish (or reuse) the connection.
    ///
    /// Idempotent once established. Concurrent callers, on this handle
    /// or on any session sharing the coordinator, coalesce onto a
    /// single transport handshake and all resolve with the same
    /// connection or the same error. When `username` is supplied it
    /// rides in the transport setup data and a join handshake is
    /// triggered as a best-effort follow-up after the connect resolves.
    pub async fn connect(&self, username: Option<&str>) -> Result<Arc<T::Conn>, ConnectError> {
        let attempt = {
            let mut state = self.state();
            if let Some(conn) = state.conn.clone() {
                debug!("already connected; reusing the established connection");
                return Ok(conn);
            }
            if let Some(attempt) = state.connecting.clone() {
                debug!("connect already in flight on this session; awaiting it");
                attempt
            } else if let Some(attempt) = self.coordinator.pending() {
                debug!("connect already in flight elsewhere in the process; awaiting it");
                attempt
            } else {
                let attempt = self.establish(username.map(str::to_owned), state.generation);
                state.connecting = Some(attempt.clone());
                self.coordinator.store(attempt.clone());
                // Driver task: the attempt must settle (and release the
                // coalescing slots) even if every caller stops awaiting.
                tokio::spawn(attempt.clone().map(drop));
                attempt
            }
        };
        attempt.await
    }

    fn establish(&self, username: Option<String>, generation: u64) -> Attempt<T::Conn> {
        let session = self.clone();
        let endpoint = self.config.endpoint.clone();
        let setup = self.config.connection_setup(username.as_deref());
        async move {
            let opened = match validate_endpoint(&endpoint) {
                Ok(url) => session.transport.open(&url, setup).await,
                Err(error) => Err(error),
            };
            match opened {
                Ok(conn) => session.finish_establish(Arc::new(conn), generation, username),
                Err(error) => {
                    {
                        let mut state = session.state();
                        if state.generation == generation {
                            state.connecting = None;
                        }
                    }
                    session.coordinator.clear();
                    warn!(error = %error, "connection establishment failed");
                    Err(ConnectError::new(error))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn finish_establish(
        &self,
        conn: Arc<T::Conn>,
        generation: u64,
        username: Option<String>,
    ) -> Result<Arc<T::Conn>, ConnectError> {
        let stale = {
            let mut state = self.state();
            if state.generation == generation {
                state.conn = Some(Arc::clone(&conn));
                state.connecting = None;
                false
            } else {
                true
            }
        };
        self.coordinator.clear();
        if stale {
            warn!("connection established after teardown; closing it");
            tokio::spawn(async move { conn.close().await });
            return Err(ConnectError::new(anyhow!(
                "session was torn down during connection establishment"
            )));
        }
        info!(endpoint = %self.config.endpoint, "connection established");
        if let Some(username) = username {
            // Best-effort follow-up: a failed auto join must not unwind
            // the connect that already resolved.
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(error) = session.join(&username).await {
                    warn!(username = %username, error = %error, "automatic join after connect failed");
                }
            });
        }
        Ok(conn)
    }

    /// Announce `username` to the room.
    ///
    /// Idempotent per identity per connection lifetime: once a join has
    /// succeeded, repeat calls resolve without touching the server.
    pub async fn join(&self, username: &str) -> Result<(), SessionError> {
        let conn = {
            let state = self.state();
            if state.joined.contains(username) {
                debug!(username = %username, "already joined on this connection; skipping handshake");
                return Ok(());
            }
            state.conn.clone().ok_or(SessionError::NotConnected)?
        };
        let route = encode_route(&self.config.routes.join)?;
        let payload = serde_json::to_value(ChatMessage::join(username))?;
        conn.request_response(route, payload).await.map_err(SessionError::Transport)?;
        self.state().joined.insert(username.to_owned());
        info!(username = %username, "joined the room");
        Ok(())
    }

    /// Notify the server that `username` is leaving.
    ///
    /// Never fails: the local intent to leave stands whether or not the
    /// server acknowledges, so failures are logged and swallowed and a
    /// missing acknowledgment is abandoned after a short timeout.
    pub async fn leave(&self, username: &str) {
        let Some(conn) = self.state().conn.clone() else {
            debug!("leave requested without a connection; nothing to send");
            return;
        };
        let notify = async {
            let route = encode_route(&self.config.routes.leave)?;
            let payload = serde_json::to_value(ChatMessage::leave(username))?;
            conn.request_response(route, payload).await
        };
        match tokio::time::timeout(LEAVE_ACK_TIMEOUT, notify).await {
            Ok(Ok(())) => debug!(username = %username, "left the room"),
            Ok(Err(error)) => warn!(username = %username, error = %error, "leave notification failed"),
            Err(_) => warn!(username = %username, "leave acknowledgment timed out"),
        }
    }

    /// Fire a chat line at the room.
    ///
    /// Failures surface in logs only; nothing is awaited by the caller
    /// and nothing is raised past this boundary. Delivery still uses an
    /// acknowledged request so transport errors are observable at all.
    pub fn send(&self, username: &str, text: &str) {
        let Some(conn) = self.state().conn.clone() else {
            error!("send requested without a connection; dropping message");
            return;
        };
        let route = self.config.routes.send.clone();
        let message = ChatMessage::chat(username, text);
        tokio::spawn(async move {
            let outcome = async {
                let route = encode_route(&route)?;
                let payload = serde_json::to_value(message)?;
                conn.request_response(route, payload).await
            }
            .await;
            if let Err(error) = outcome {
                error!(error = %error, "message send failed");
            }
        });
    }

    /// Open the inbound message stream, delivering well-formed chat
    /// messages to `on_message`.
    ///
    /// At most one subscription is live per connection: any existing
    /// one is cancelled before the new stream opens. Payloads that are
    /// binary-shaped, unparsable, or content-free are dropped with a
    /// warning and never reach the callback.
    pub async fn subscribe<F>(&self, on_message: F) -> Result<Subscription, SessionError>
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        let (conn, previous, id, generation) = {
            let mut state = self.state();
            let conn = state.conn.clone().ok_or(SessionError::NotConnected)?;
            let previous = state.subscription.take();
            state.next_subscription_id += 1;
            (conn, previous, state.next_subscription_id, state.generation)
        };
        if let Some(previous) = previous {
            debug!("cancelling the previous inbound subscription before resubscribing");
            previous.cancel();
        }

        let route = encode_route(&self.config.routes.stream)?;
        let mut stream = conn
            .request_stream(route, serde_json::json!({}))
            .await
            .map_err(SessionError::Transport)?;
        // A push feed must not stall waiting on per-item demand.
        stream.request(UNBOUNDED_DEMAND);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let subscription = Subscription {
            inner: Arc::new(SubscriptionInner { id, cancel_tx: Mutex::new(Some(cancel_tx)) }),
        };
        {
            let mut state = self.state();
            if state.generation != generation {
                drop(state);
                stream.cancel();
                return Err(SessionError::NotConnected);
            }
            state.subscription = Some(subscription.clone());
        }

        tokio::spawn(pump(stream, cancel_rx, on_message, Arc::clone(&self.state), id));
        Ok(subscription)
    }

    /// Tear everything down: subscription, connection, pending
    /// establishment, joined identities. Safe to call at any time, any
    /// number of times; every step runs and none can fail.
    pub async fn disconnect(&self) {
        let (subscription, conn) = {
            let mut state = self.state();
            state.generation += 1;
            state.connecting = None;
            state.joined.clear();
            (state.subscription.take(), state.conn.take())
        };
        self.coordinator.clear();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        if let Some(conn) = conn {
            conn.close().await;
            info!("connection closed");
        }
    }
}

/// Drives one inbound stream: classifies payloads, forwards chat
/// messages, and clears the active-subscription slot on exit so a
/// later resubscribe starts clean.
async fn pump<C, F>(
    mut stream: Box<dyn InboundStream>,
    mut cancel_rx: oneshot::Receiver<()>,
    on_message: F,
    state: Arc<Mutex<SessionState<C>>>,
    id: u64,
) where
    C: Send + Sync + 'static,
    F: Fn(ChatMessage) + Send + 'static,
{
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                stream.cancel();
                debug!(subscription = id, "inbound subscription cancelled");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(payload)) => match decode_payload(&payload) {
                    DecodedPayload::Message(message) => on_message(message),
                    DecodedPayload::Binary => {
                        warn!(subscription = id, "dropping binary-shaped stream payload");
                    }
                    DecodedPayload::Malformed(reason) => {
                        warn!(subscription = id, reason = %reason, "dropping malformed stream payload");
                    }
                },
                Some(Err(error)) => {
                    warn!(subscription = id, error = %error, "inbound stream failed");
                    break;
                }
                None => {
                    debug!(subscription = id, "inbound stream completed");
                    break;
                }
            }
        }
    }
    // Clear the slot unless a replacement is already installed.
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.subscription.as_ref().is_some_and(|s| s.id() == id) {
        state.subscription = None;
    }
}

fn validate_endpoint(value: &str) -> Result<Url> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid endpoint `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("endpoint must use wss (ws is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
