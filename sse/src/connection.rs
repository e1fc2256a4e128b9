use crate::auth::{AuthSnapshot, Authorizer, Identity};
use crate::error::{connection_error, transport_error, ConnectionErrorKind, Error};
use crate::matcher::{CapabilityMatcher, RegisteredSubscription};
use crate::message::{EventEnvelope, Frame};
use crate::registry::{ActiveConnections, ConnectionKey};
use events::ScopeType;
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Item type of a connection's outbound channel. An `Err` aborts the HTTP body.
pub type Outbound = Result<Frame, Error>;

/// Slots of every outbound channel that only the final item of a stream may use.
const TERMINAL_SLOTS: usize = 1;

/// Channel for one connection: `buffer` frames of events and keep-alives, plus
/// room for the item that ends the stream.
pub fn outbound_channel(buffer: usize) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
    mpsc::channel(buffer.max(1) + TERMINAL_SLOTS)
}

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything the HTTP layer supplies when a client asks for a stream.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub identity: Identity,
    pub project_id: String,
    pub scope_type: ScopeType,
    pub subscriptions: Vec<RegisteredSubscription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Opened,
    Closed,
}

/// Result of handing one frame to the outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Buffer full (or not yet opened); the frame is gone.
    Dropped,
    Closed,
}

/// One client stream.
///
/// Subscriptions are fixed at construction; only the authorization snapshot
/// changes over the lifetime of a connection, and only through `open` and
/// `refresh`. Writes never block: each frame is either buffered or dropped,
/// except that the error closing the stream always has a slot reserved for it
/// when the channel comes from [`outbound_channel`].
pub struct Connection {
    id: ConnectionId,
    project_id: String,
    scope_type: ScopeType,
    identity: Identity,
    matcher: CapabilityMatcher,
    auth: RwLock<Option<Arc<AuthSnapshot>>>,
    /// Set once by `open`; its presence means the connection was activated.
    registry_key: OnceLock<ConnectionKey>,
    sender: Mutex<Option<mpsc::Sender<Outbound>>>,
    closed: AtomicBool,
    cleaned_up: AtomicBool,
    cancel: CancellationToken,
    /// Serializes open and refresh, held across the authorizer call.
    lifecycle: tokio::sync::Mutex<()>,
    /// Serializes registry renewals with unregistration.
    liveness: tokio::sync::Mutex<()>,
    authorizer: Arc<dyn Authorizer>,
    registry: Arc<ActiveConnections>,
}

impl Connection {
    pub fn new(
        options: OpenOptions,
        sender: mpsc::Sender<Outbound>,
        authorizer: Arc<dyn Authorizer>,
        registry: Arc<ActiveConnections>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            project_id: options.project_id,
            scope_type: options.scope_type,
            identity: options.identity,
            matcher: CapabilityMatcher::for_subscriptions(&options.subscriptions),
            auth: RwLock::new(None),
            registry_key: OnceLock::new(),
            sender: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            liveness: tokio::sync::Mutex::new(()),
            authorizer,
            registry,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn scope_type(&self) -> ScopeType {
        self.scope_type
    }

    /// Compiled registered subscriptions.
    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }

    pub fn registry_key(&self) -> Option<&ConnectionKey> {
        self.registry_key.get()
    }

    /// Current authorization snapshot. Fails if `open` has not completed.
    pub fn auth(&self) -> Result<Arc<AuthSnapshot>, Error> {
        self.auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                connection_error(
                    ConnectionErrorKind::NotOpened,
                    "authorization snapshot read before open",
                )
            })
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.registry_key.get().is_some() {
            ConnectionState::Opened
        } else {
            ConnectionState::Created
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when this connection closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claims the one-time cleanup of this connection. True for the first caller only.
    pub(crate) fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::AcqRel)
    }

    fn apply_snapshot(&self, snapshot: AuthSnapshot) {
        *self.auth.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));
    }

    /// Fetch the initial snapshot and mark this connection alive in the registry.
    /// Must be called exactly once, before any `send`.
    pub async fn open(&self) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;

        if self.is_closed() {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "cannot open a closed connection",
            ));
        }
        if self.registry_key.get().is_some() {
            return Err(connection_error(
                ConnectionErrorKind::AlreadyOpened,
                "connection opened twice",
            ));
        }

        let snapshot = self.authorizer.fetch(&self.identity).await?;
        let key = ConnectionKey {
            tenant_id: snapshot.tenant_id.clone(),
            principal_id: snapshot.principal.id.clone(),
            connection_id: self.id.to_string(),
        };

        self.registry.register(&key).await?;
        self.apply_snapshot(snapshot);
        let _ = self.registry_key.set(key);

        info!(
            "Opened SSE connection {} for project {} ({})",
            self.id, self.project_id, self.scope_type
        );
        Ok(())
    }

    /// Serialize an event and buffer it. Never waits for the client.
    pub fn send(&self, envelope: &EventEnvelope) -> Delivery {
        if self.registry_key.get().is_none() {
            warn!("Dropping event for connection {} that was never opened", self.id);
            return Delivery::Dropped;
        }

        match envelope.to_frame() {
            Ok(frame) => self.write(frame),
            Err(e) => {
                error!("Failed to serialize event for connection {}: {e}", self.id);
                Delivery::Dropped
            }
        }
    }

    /// Buffer an event or keep-alive, leaving the terminal slots free.
    fn write(&self, frame: Frame) -> Delivery {
        self.push(Ok(frame), TERMINAL_SLOTS)
    }

    /// Buffer the last item of the stream. Only ever followed by `close`.
    fn write_terminal(&self, item: Outbound) -> Delivery {
        self.push(item, 0)
    }

    fn push(&self, item: Outbound, keep_free: usize) -> Delivery {
        // Capacity check and send happen under the sender lock.
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Delivery::Closed;
        };
        if sender.is_closed() {
            return Delivery::Closed;
        }
        if sender.capacity() <= keep_free {
            debug!(
                "Outbound buffer full for connection {}, dropping frame",
                self.id
            );
            return Delivery::Dropped;
        }

        match sender.try_send(item) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                debug!(
                    "Outbound buffer full for connection {}, dropping frame",
                    self.id
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Write a keep-alive frame and renew registry liveness. No-op before
    /// `open` and after `close`; never waits on an in-flight `refresh`.
    pub async fn ping(&self) -> Result<(), Error> {
        let _guard = self.liveness.lock().await;
        let Some(key) = self.registry_key.get() else {
            return Ok(());
        };
        if self.is_closed() {
            return Ok(());
        }

        self.write(Frame::ping());
        self.registry.renew(key).await
    }

    /// Re-fetch the authorization snapshot and swap it in.
    ///
    /// A withdrawn or expired credential ends the stream with an error frame.
    /// Any other failure aborts the stream with a transport error and is
    /// returned to the caller.
    pub async fn refresh(&self) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        if self.registry_key.get().is_none() || self.is_closed() {
            return Ok(());
        }

        match self.authorizer.fetch(&self.identity).await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot);
                trace!("Refreshed authorization for connection {}", self.id);
                Ok(())
            }
            Err(e) if e.is_recoverable_authorization() => {
                info!(
                    "Closing connection {} after authorization was withdrawn: {e}",
                    self.id
                );
                self.write_terminal(Ok(Frame::error(&e.to_string())));
                self.close();
                Ok(())
            }
            Err(e) => {
                error!(
                    "Authorization refresh failed for connection {}: {e}",
                    self.id
                );
                self.abort(&format!("authorization refresh failed: {e}"));
                Err(e)
            }
        }
    }

    /// End the stream with a transport error, so the client sees an abrupt
    /// disconnect rather than a clean end of stream.
    pub fn abort(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.write_terminal(Err(transport_error(reason)));
        self.close();
    }

    /// Close, then remove this connection from the registry once no
    /// heartbeat is renewing it.
    pub async fn release(&self) -> Result<(), Error> {
        self.close();

        let _guard = self.liveness.lock().await;
        match self.registry_key.get() {
            Some(key) => self.registry.unregister(key).await,
            None => Ok(()),
        }
    }

    /// Release the outbound channel. Idempotent; safe alongside in-flight sends.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        // Dropping the sender ends the stream once buffered frames are read.
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        debug!("Closed SSE connection {}", self.id);
    }
}
