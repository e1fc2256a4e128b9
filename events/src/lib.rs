//! Event bus infrastructure for the event gateway.
//!
//! This crate provides the publish/subscribe channel that decouples event
//! producers from stream delivery.
//!
//! # Architecture
//!
//! - **BusEvent**: A project-scoped event carrying one record or a batch
//! - **EventHandler**: Trait for implementing bus subscribers
//! - **EventBus**: Publishes events to every current subscriber
//! - **RedisRelay**: Feeds events published by other processes into the local bus
//!
//! This crate has no dependencies on internal crates, so both producers and the
//! `sse` crate can depend on it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub mod error;
pub mod event;
pub mod relay;

pub use error::{Error, ErrorKind};
pub use event::{BusEvent, DomainEventKind, EventPayload, EventRecord, PublicEventKind, ScopeType};

/// Identifies one handler registration on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait for handling bus events.
///
/// Handlers run inline on the publisher's task, one after another, so an
/// implementation must not wait on anything slow.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BusEvent);
}

/// Publishes events to dynamically registered handlers.
/// Cloning is cheap; clones share the same handler set.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<DashMap<SubscriptionId, Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Register a handler. It receives every event published after this call.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.handlers.insert(id, handler);
        id
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.handlers.remove(id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Publish an event to all registered handlers.
    pub async fn publish(&self, event: BusEvent) {
        // Snapshot first: handlers may unsubscribe themselves while running.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handler in handlers {
            handler.handle(&event).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
