//! HTTP adapters for embedding the pipeline in an axum application.
//!
//! The surrounding service owns routing and authentication; it inserts a
//! [`Principal`] extension and mounts these handlers.

pub mod handlers;
pub mod requests;
pub mod responses;
pub mod state;

pub use handlers::{confirm_subscription, publish_issue, subscribe, IdempotencyKeyHeader};
pub use state::{AppState, Principal};
