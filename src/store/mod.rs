//! Durable counter store: backend contract, counter encoding, and the
//! per-key-locked store the rest of the crate writes through.

pub mod backend;
pub mod codec;
pub mod counter_store;
pub mod json_file;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use crate::core::config::{Config, StoreBackendKind};
use crate::core::errors::Result;
use crate::store::backend::StorageBackend;

/// Open the backend selected by configuration.
pub fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.store.backend {
        #[cfg(feature = "sqlite")]
        StoreBackendKind::Sqlite => Ok(Arc::new(sqlite::SqliteBackend::open(
            &config.paths.store_db,
        )?)),
        #[cfg(not(feature = "sqlite"))]
        StoreBackendKind::Sqlite => Err(crate::core::errors::BeaconError::InvalidConfig {
            details: "store.backend = \"sqlite\" requires the sqlite feature".to_string(),
        }),
        StoreBackendKind::Json => Ok(Arc::new(json_file::JsonFileBackend::open(
            &config.paths.store_json,
        )?)),
    }
}
