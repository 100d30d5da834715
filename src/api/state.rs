use std::sync::Arc;

use crate::idempotency::{CoordinatorConfig, RequestCoordinator};
use crate::repositories::Store;
use crate::services::SubscriptionService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub coordinator: Arc<RequestCoordinator>,
    /// Public base URL used to build confirmation links.
    pub base_url: String,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: CoordinatorConfig, base_url: impl Into<String>) -> Self {
        let coordinator = Arc::new(RequestCoordinator::new(Arc::clone(&store), config));
        Self {
            store,
            coordinator,
            base_url: base_url.into(),
        }
    }

    pub fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(Arc::clone(&self.store))
    }
}

/// Authenticated caller, inserted as a request extension by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}
