//! Offline-first sync engine for the rancho farm administration app.
//!
//! Requests are intercepted by a [`dispatcher::Dispatcher`], which serves them
//! from the network or a local SQLite cache depending on their category. Writes
//! that cannot reach the API are queued in the [`store::Store`] and replayed by
//! the [`processor::SyncProcessor`] once connectivity returns.

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod processor;
pub mod store;

pub use engine::{Engine, EngineOptions};
pub use error::{Result, SyncError};
