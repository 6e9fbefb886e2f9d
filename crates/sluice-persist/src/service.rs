//! Service facade bundling the four components over one store session.

use std::sync::Arc;

use crate::chunks::ChunkCoordinator;
use crate::config::StoreConfig;
use crate::jobs::JobRegistry;
use crate::pipelines::PipelineRegistry;
use crate::schema::SchemaManager;
use crate::store::DocumentStore;

/// The persistence and coordination service.
///
/// Owns the process-wide store session and hands out the components that
/// share it. The session is initialized once at boot and released when the
/// service is dropped.
#[derive(Clone)]
pub struct PersistService {
    store: Arc<dyn DocumentStore>,
    database: String,
}

impl PersistService {
    /// Creates a service over an already-connected store session.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }

    /// Creates a service using the database named in the configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn DocumentStore>, config: &StoreConfig) -> Self {
        Self::new(store, config.database.clone())
    }

    /// The schema manager for this session.
    #[must_use]
    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.store.clone(), self.database.clone())
    }

    /// The job registry for this session.
    #[must_use]
    pub fn jobs(&self) -> JobRegistry {
        JobRegistry::new(self.store.clone(), self.database.clone())
    }

    /// The pipeline registry for this session.
    #[must_use]
    pub fn pipelines(&self) -> PipelineRegistry {
        PipelineRegistry::new(self.store.clone(), self.database.clone())
    }

    /// The chunk coordinator for this session.
    #[must_use]
    pub fn chunks(&self) -> ChunkCoordinator {
        ChunkCoordinator::new(self.store.clone(), self.database.clone())
    }
}
