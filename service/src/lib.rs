//! Process-wide infrastructure shared by the gateway binary and the web layer.

pub mod config;
pub mod logging;
