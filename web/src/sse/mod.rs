//! SSE HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for the event stream endpoint.
//! Connection lifecycle, authorization and fan-out live in the `sse` crate.

pub mod handler;
