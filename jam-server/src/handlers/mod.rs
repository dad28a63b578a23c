//! Listeners facing browsers and workers
//!
//! - `client`: WebSocket links carrying `tok:`, `ses:` and `jam:` frames
//! - `handshake`: one-frame connections from freshly started workers

pub mod client;
pub mod handshake;

use std::sync::Arc;

use crate::auth::AuthRegistry;
use crate::router::MessageRouter;
use crate::store::DocumentStore;
use crate::workers::WorkerManager;

/// Shared state handed to every link handler
pub struct ServerContext {
    pub auth: Arc<AuthRegistry>,
    pub router: Arc<MessageRouter>,
    pub workers: Arc<WorkerManager>,
    pub store: Arc<dyn DocumentStore>,
}

impl ServerContext {
    pub fn new(
        auth: Arc<AuthRegistry>,
        router: Arc<MessageRouter>,
        workers: Arc<WorkerManager>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            auth,
            router,
            workers,
            store,
        }
    }
}
