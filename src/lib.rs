//! Multi-channel user notification engine.
//!
//! Hosts register typed notices, users opt in or out per delivery backend,
//! and sends either fan out immediately or land in a durable queue drained
//! by a background worker. See [`dispatch::Dispatcher`] for the entry
//! points and [`engine::DrainEngine`] for the queue side.

// Supporting infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Domain layer
pub mod alerts;
pub mod backends;
pub mod context;
pub mod model;
pub mod render;
pub mod store;
pub mod users;

// Engine layer
pub mod dispatch;
pub mod engine;
pub mod observers;
pub mod tasks;
