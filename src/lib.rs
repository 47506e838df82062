//! Download and fetch-coordination core for a decentralized software
//! installer: a bounded worker pool streams feed and implementation
//! downloads over pooled HTTP connections, and a driver loop repeatedly
//! consults an external solver, fetching whatever feeds or implementations
//! it's still missing until a selection is ready (or no further progress is
//! possible).

pub mod blocker;
pub mod collab;
pub mod config;
pub mod download;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod network;
mod opener;
pub mod pool;
pub mod queue;
