//! Courier HTTP API and service configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::{storage::Storage, Clock};
use courier_delivery::WebhookService;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ErrorResponse};
pub use server::{create_router, start_server};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Delivery operations.
    pub service: Arc<WebhookService>,
    /// Database checked by readiness probes; `None` for in-memory backends.
    pub storage: Option<Arc<Storage>>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates the shared state.
    pub fn new(
        service: Arc<WebhookService>,
        storage: Option<Arc<Storage>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { service, storage, clock }
    }
}
