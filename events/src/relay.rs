//! Cross-process delivery for the event bus.
//!
//! Producers in any process call [`publish_remote`]; every gateway process runs
//! a [`RedisRelay`] that subscribes to the same channel and republishes each
//! decoded event on its local [`EventBus`]. Delivery is at-most-once: events
//! published while a relay is reconnecting are lost.

use crate::{BusEvent, Error, EventBus};
use futures_util::StreamExt;
use log::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect delay that doubles per failed attempt up to a ceiling.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

pub struct RedisRelay {
    client: redis::Client,
    channel: String,
    bus: EventBus,
}

impl RedisRelay {
    pub fn new(redis_url: &str, channel: impl Into<String>, bus: EventBus) -> Result<Self, Error> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            channel: channel.into(),
            bus,
        })
    }

    /// Listen until `shutdown` fires, reconnecting with backoff on failure.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Event relay on channel {} shutting down", self.channel);
                    return;
                }
                outcome = self.listen(&mut backoff) => match outcome {
                    Ok(()) => warn!("Event relay stream on {} ended, reconnecting", self.channel),
                    Err(e) => warn!("Event relay on {} failed: {e}", self.channel),
                }
            }

            let delay = backoff.next_delay();
            debug!("Event relay reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn listen(&self, backoff: &mut Backoff) -> Result<(), Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!("Event relay subscribed to channel {}", self.channel);
        backoff.reset();

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping non-text relay message: {e}");
                    continue;
                }
            };

            match decode(&payload) {
                Ok(event) => self.bus.publish(event).await,
                Err(e) => warn!("Skipping undecodable relay message: {e}"),
            }
        }

        Ok(())
    }
}

fn decode(payload: &str) -> Result<BusEvent, Error> {
    Ok(serde_json::from_str(payload)?)
}

fn publish_command(channel: &str, event: &BusEvent) -> Result<redis::Cmd, Error> {
    let payload = serde_json::to_string(event)?;
    let mut cmd = redis::cmd("PUBLISH");
    cmd.arg(channel).arg(payload);
    Ok(cmd)
}

/// Publish an event to every relay listening on `channel`.
pub async fn publish_remote<C>(
    connection: &mut C,
    channel: &str,
    event: &BusEvent,
) -> Result<(), Error>
where
    C: redis::aio::ConnectionLike + Send,
{
    let _: () = publish_command(channel, event)?
        .query_async(connection)
        .await?;
    Ok(())
}
