use events::relay::RedisRelay;
use events::EventBus;
use log::*;
use service::{config::Config, logging::Logger};
use sse::registry::{ActiveConnections, MemoryStore, RedisStore, RegistryStore};
use sse::{Manager, ManagerSettings};
use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use web::{auth::HttpAuthorizer, AppState};

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config);

    info!(
        "Starting up event gateway in {} mode",
        config.runtime_env()
    );

    if let Err(e) = run(config).await {
        error!("Event gateway stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), BoxError> {
    let bus = EventBus::new();
    let relay_shutdown = CancellationToken::new();

    let store: Arc<dyn RegistryStore> = match config.redis_url() {
        Some(redis_url) => {
            let store = RedisStore::connect(redis_url).await?;
            let relay = RedisRelay::new(redis_url, config.event_bus_channel.clone(), bus.clone())?;
            tokio::spawn(relay.run(relay_shutdown.clone()));
            Arc::new(store)
        }
        None => {
            warn!("No REDIS_URL set: connections are tracked in memory, remote events ignored");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = Arc::new(ActiveConnections::new(
        store,
        config.registry_key_prefix.clone(),
        config.connection_ttl(),
    ));
    let authorizer = Arc::new(HttpAuthorizer::new(config.permission_service_url.clone())?);
    let manager = Arc::new(Manager::new(
        bus,
        registry,
        authorizer,
        ManagerSettings {
            heartbeat_interval: config.heartbeat_interval(),
            refresh_interval: config.auth_refresh_interval(),
            outbound_buffer: config.outbound_buffer,
            max_connections_per_principal: config.max_connections_per_principal,
        },
    ));
    manager.start();

    let shutdown = {
        let manager = manager.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing event streams");
            relay_shutdown.cancel();
            manager.close().await;
        }
    };

    web::init_server(AppState::new(config, manager), shutdown).await?;
    info!("Event gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
        // Without a signal handler, keep serving.
        std::future::pending::<()>().await;
    }
}
