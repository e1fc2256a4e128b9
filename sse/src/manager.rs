use crate::auth::Authorizer;
use crate::connection::{outbound_channel, Connection, ConnectionId, OpenOptions, Outbound};
use crate::error::{connection_error, ConnectionErrorKind, Error};
use crate::event_filter::ConnectionEventFilter;
use crate::registry::ActiveConnections;
use dashmap::DashMap;
use events::{EventBus, SubscriptionId};
use futures_util::future::join_all;
use futures_util::Stream;
use log::*;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub heartbeat_interval: Duration,
    pub refresh_interval: Duration,
    /// Frames buffered per connection before new ones are dropped.
    pub outbound_buffer: usize,
    /// Fleet-wide cap per principal; 0 disables the check.
    pub max_connections_per_principal: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            refresh_interval: Duration::from_secs(60),
            outbound_buffer: 64,
            max_connections_per_principal: 10,
        }
    }
}

/// An opened stream, handed to the HTTP layer.
pub struct Subscription {
    connection: Arc<Connection>,
    receiver: mpsc::Receiver<Outbound>,
}

impl Subscription {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Frames in write order. Dropping the stream counts as a client disconnect.
    pub fn into_stream(self) -> impl Stream<Item = Outbound> {
        let mut receiver = self.receiver;
        async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        }
    }

    pub fn into_parts(self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        (self.connection, self.receiver)
    }
}

struct LocalConnection {
    connection: Arc<Connection>,
    bus_subscription: SubscriptionId,
}

type LocalConnections = Arc<DashMap<ConnectionId, LocalConnection>>;

/// Teardown shared by every close path: client disconnect, revoked
/// authorization and service shutdown. Runs at most once per connection.
#[derive(Clone)]
struct Cleanup {
    bus: EventBus,
    connections: LocalConnections,
}

impl Cleanup {
    async fn run(&self, connection: &Connection) {
        if !connection.begin_cleanup() {
            return;
        }

        if let Some((_, local)) = self.connections.remove(connection.id()) {
            self.bus.unsubscribe(&local.bus_subscription);
        }

        if let Err(e) = connection.release().await {
            warn!(
                "Failed to remove connection {} from the registry: {e}",
                connection.id()
            );
        }

        info!("Cleaned up SSE connection {}", connection.id());
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Heartbeat,
    AuthRefresh,
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sweep::Heartbeat => write!(f, "heartbeat"),
            Sweep::AuthRefresh => write!(f, "auth refresh"),
        }
    }
}

/// Distributes bus events to the SSE connections held by this process.
///
/// Each connection gets its own bus handler that authorizes every record
/// before buffering it. Two background sweeps keep connections alive in the
/// fleet registry and re-fetch their authorization.
pub struct Manager {
    bus: EventBus,
    registry: Arc<ActiveConnections>,
    authorizer: Arc<dyn Authorizer>,
    connections: LocalConnections,
    settings: ManagerSettings,
    shutdown: CancellationToken,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        bus: EventBus,
        registry: Arc<ActiveConnections>,
        authorizer: Arc<dyn Authorizer>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            bus,
            registry,
            authorizer,
            connections: Arc::new(DashMap::new()),
            settings,
            shutdown: CancellationToken::new(),
            sweeps: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Connections held by this process.
    pub fn local_connection_count(&self) -> usize {
        self.connections.len()
    }

    fn cleanup(&self) -> Cleanup {
        Cleanup {
            bus: self.bus.clone(),
            connections: self.connections.clone(),
        }
    }

    /// Start the heartbeat and auth-refresh sweeps. Calling it again is a no-op.
    pub fn start(&self) {
        let mut sweeps = self.sweeps.lock().unwrap_or_else(PoisonError::into_inner);
        if !sweeps.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        sweeps.push(self.spawn_sweep(Sweep::Heartbeat, self.settings.heartbeat_interval));
        sweeps.push(self.spawn_sweep(Sweep::AuthRefresh, self.settings.refresh_interval));
        info!(
            "SSE manager started (heartbeat every {:?}, auth refresh every {:?})",
            self.settings.heartbeat_interval, self.settings.refresh_interval
        );
    }

    fn spawn_sweep(&self, sweep: Sweep, period: Duration) -> JoinHandle<()> {
        let connections = self.connections.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => run_sweep(sweep, period, &connections).await,
                }
            }
            debug!("{sweep} sweep stopped");
        })
    }

    /// Open a stream for a client and attach it to the bus.
    ///
    /// Fails without side effects when authorization or registration fails, or
    /// when the principal already holds the maximum number of streams.
    pub async fn subscribe(&self, options: OpenOptions) -> Result<Subscription, Error> {
        if self.shutdown.is_cancelled() {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "event distribution is shutting down",
            ));
        }

        let (sender, receiver) = outbound_channel(self.settings.outbound_buffer);
        let disconnect_watch = sender.clone();
        let connection = Arc::new(Connection::new(
            options,
            sender,
            self.authorizer.clone(),
            self.registry.clone(),
        ));

        connection.open().await?;

        if let Err(e) = self.enforce_connection_limit(&connection).await {
            self.cleanup().run(&connection).await;
            return Err(e);
        }

        let bus_subscription = self
            .bus
            .subscribe(Arc::new(ConnectionEventFilter::new(connection.clone())));
        self.connections.insert(
            connection.id().clone(),
            LocalConnection {
                connection: connection.clone(),
                bus_subscription,
            },
        );
        self.spawn_disconnect_watcher(connection.clone(), disconnect_watch);

        // `close` may have swept the map while this connection was opening.
        if self.shutdown.is_cancelled() {
            self.cleanup().run(&connection).await;
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "event distribution is shutting down",
            ));
        }

        debug!(
            "Registered SSE connection {} ({} local)",
            connection.id(),
            self.connections.len()
        );
        Ok(Subscription {
            connection,
            receiver,
        })
    }

    async fn enforce_connection_limit(&self, connection: &Connection) -> Result<(), Error> {
        let limit = self.settings.max_connections_per_principal;
        if limit == 0 {
            return Ok(());
        }

        let snapshot = connection.auth()?;
        match self
            .registry
            .count(&snapshot.tenant_id, &snapshot.principal.id)
            .await
        {
            Ok(count) if count > limit => {
                warn!(
                    "Principal {} exceeded {} concurrent SSE connections",
                    snapshot.principal.id, limit
                );
                Err(connection_error(
                    ConnectionErrorKind::LimitExceeded,
                    "too many concurrent event streams",
                ))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Could not count active connections, admitting stream: {e}");
                Ok(())
            }
        }
    }

    /// Clean up once the client drops the stream or the connection closes itself.
    fn spawn_disconnect_watcher(
        &self,
        connection: Arc<Connection>,
        watch: mpsc::Sender<Outbound>,
    ) {
        let cleanup = self.cleanup();

        tokio::spawn(async move {
            let cancelled = connection.cancellation();
            tokio::select! {
                _ = watch.closed() => {
                    debug!("Client disconnected from SSE connection {}", connection.id());
                }
                _ = cancelled.cancelled() => {}
            }
            // Release our handle so the stream can end.
            drop(watch);
            cleanup.run(&connection).await;
        });
    }

    /// Live connections of a principal across every process, pruning stale entries.
    pub async fn active_connections_count(
        &self,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<usize, Error> {
        self.registry.count(tenant_id, principal_id).await
    }

    /// Stop both sweeps and close every connection.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let sweeps = std::mem::take(
            &mut *self.sweeps.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(sweeps).await {
            if let Err(e) = result {
                warn!("SSE sweep task ended abnormally: {e}");
            }
        }

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().connection.clone())
            .collect();
        let cleanup = self.cleanup();
        for connection in &connections {
            cleanup.run(connection).await;
        }

        info!(
            "SSE manager closed ({} connection(s) terminated)",
            connections.len()
        );
    }
}

/// Run one sweep over every open connection. Each connection runs on its own
/// task so a failure (or panic) in one cannot stop the others, and no task
/// may take longer than one `period`. A refresh that times out fails closed.
async fn run_sweep(sweep: Sweep, period: Duration, connections: &LocalConnections) {
    let targets: Vec<Arc<Connection>> = connections
        .iter()
        .map(|entry| entry.value().connection.clone())
        .filter(|connection| !connection.is_closed())
        .collect();

    if targets.is_empty() {
        return;
    }
    trace!("Running {sweep} sweep over {} connection(s)", targets.len());

    let tasks = targets.into_iter().map(|connection| {
        tokio::spawn(async move {
            let work = async {
                match sweep {
                    Sweep::Heartbeat => connection.ping().await,
                    Sweep::AuthRefresh => connection.refresh().await,
                }
            };

            match tokio::time::timeout(period, work).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{sweep} failed for connection {}: {e}", connection.id()),
                Err(_) => {
                    warn!(
                        "{sweep} for connection {} did not finish within {period:?}",
                        connection.id()
                    );
                    if let Sweep::AuthRefresh = sweep {
                        connection.abort("authorization refresh timed out");
                    }
                }
            }
        })
    });

    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!("{sweep} task for a connection panicked: {e}");
        }
    }
}
