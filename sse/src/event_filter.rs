use crate::connection::{Connection, Delivery};
use crate::matcher::Candidate;
use crate::message::EventEnvelope;
use async_trait::async_trait;
use events::{BusEvent, EventHandler, EventPayload, EventRecord};
use log::*;
use std::sync::Arc;

/// Narrow a bus event down to what one connection may receive.
///
/// Returns `None` when the event belongs to another scope or when no record
/// survives authorization. A record survives only if the connection's
/// registered subscriptions ask for it and its current capability snapshot
/// grants it; both are evaluated per record, per event.
pub fn filter_event_for_client(connection: &Connection, event: &BusEvent) -> Option<EventEnvelope> {
    if event.scope_type != connection.scope_type() || event.project_id != connection.project_id() {
        return None;
    }

    let snapshot = connection.auth().ok()?;
    let scope_type = event.scope_type;
    let kind = event.public_kind();
    let is_allowed = |record: &EventRecord| {
        let candidate = Candidate { kind, record };
        connection.matcher().allows(scope_type, &candidate)
            && snapshot.capabilities.allows(scope_type, &candidate)
    };

    let data = match &event.payload {
        EventPayload::Single(record) => {
            if !is_allowed(record) {
                return None;
            }
            EventPayload::Single(record.clone())
        }
        EventPayload::Batch(records) => EventPayload::batch(
            records
                .iter()
                .filter(|record| is_allowed(*record))
                .cloned()
                .collect(),
        )?,
    };

    Some(EventEnvelope {
        kind,
        project_id: event.project_id.clone(),
        scope_type,
        time: event.time,
        data,
    })
}

/// Bus subscriber bound to a single connection.
///
/// Runs on the publisher's task, so it only filters and buffers; it never
/// waits on the client.
pub struct ConnectionEventFilter {
    connection: Arc<Connection>,
}

impl ConnectionEventFilter {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl EventHandler for ConnectionEventFilter {
    async fn handle(&self, event: &BusEvent) {
        if self.connection.is_closed() {
            return;
        }

        let Some(envelope) = filter_event_for_client(&self.connection, event) else {
            return;
        };

        match self.connection.send(&envelope) {
            Delivery::Sent => trace!(
                "Sent {} event to connection {}",
                envelope.kind,
                self.connection.id()
            ),
            Delivery::Dropped => {}
            Delivery::Closed => debug!(
                "Connection {} closed before {} event could be sent",
                self.connection.id(),
                envelope.kind
            ),
        }
    }
}
