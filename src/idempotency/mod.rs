pub mod handler;
pub mod key;
pub mod storage;

pub use handler::{
    CoordinatedResponse, CoordinatorConfig, IdempotencyMetrics, MetricsSnapshot,
    RequestCoordinator, TransactionalHandler,
};
pub use key::{request_fingerprint, IdempotencyKey};
pub use storage::{
    BeginOutcome, HeaderPair, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    StartAttempt, StoredResponse,
};
