//! Switchboard - a hostname-multiplexed reverse proxy
//!
//! This library provides a reverse proxy that:
//! - Derives a routing key from each request's Host header (or an override header)
//! - Provisions one backend per key on first use, on its own port
//! - Deduplicates concurrent creation so a key never starts twice
//! - Bounds the number of backends and isolates backend crashes
//! - Publishes `started`, `stopped` and `error` lifecycle events
//! - Tears every backend down on shutdown and waits for confirmation

pub mod admin;
pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod forward;
pub mod process;
mod provisioner;
pub mod registry;
pub mod router;
