//! Authorization-aware Server-Sent Events distribution.
//!
//! Domain events published on the [`events::EventBus`] are fanned out to
//! long-lived client streams. Every record of every event is checked against
//! the client's registered subscriptions and against its current capability
//! snapshot before it is written; nothing unauthorized ever leaves the
//! process.
//!
//! # Architecture
//!
//! - **Capability matching** (`matcher`): subscriptions and capability rules
//!   compile to the same glob-based matcher, evaluated per record.
//! - **Connections** (`connection`): one per client stream. Each owns a
//!   bounded outbound buffer; a slow client loses frames instead of stalling
//!   the publisher.
//! - **Fleet registry** (`registry`): a TTL-backed record of live
//!   connections shared by every process, so per-principal counts survive a
//!   crashed node.
//! - **Distribution** (`manager`): attaches connections to the bus and runs
//!   the heartbeat and auth-refresh sweeps.
//!
//! # Message Flow
//!
//! 1. The HTTP layer calls [`Manager::subscribe`] with the caller's identity
//!    and registered subscriptions.
//! 2. The connection fetches its first authorization snapshot and records
//!    itself in the registry.
//! 3. A per-connection bus handler filters each published event and buffers
//!    what survives as an SSE frame.
//! 4. Heartbeats renew registry liveness; refreshes swap the snapshot, or end
//!    the stream once access is withdrawn.
//!
//! # Modules
//!
//! - `auth`: identity, principal and snapshot types plus the `Authorizer` seam
//! - `connection`: a single client stream and its lifecycle
//! - `event_filter`: per-record authorization of bus events
//! - `manager`: bus attachment, sweeps and teardown
//! - `matcher`: capability rules and glob matching
//! - `message`: wire frames and the event envelope
//! - `registry`: fleet-wide active connection tracking

pub mod auth;
pub mod connection;
pub mod error;
pub mod event_filter;
pub mod manager;
pub mod matcher;
pub mod message;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::Error;
pub use manager::{Manager, ManagerSettings, Subscription};
