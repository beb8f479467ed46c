//! Metadata store abstraction and implementations for Ferry.
//!
//! This crate owns the shared state the upload core coordinates through:
//! - Lock rows, one per upload resource being mutated
//! - Lock release notifications (in-process or `LISTEN/NOTIFY`)
//! - Read-only bucket and tenant size limits

pub mod error;
pub mod models;
pub mod notify;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use notify::{LocalNotifier, LockNotifier, LockSubscription, PgNotifier};
pub use postgres::PostgresStore;
pub use store::{MetadataStore, SqliteStore};

use ferry_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            max_connections,
            statement_timeout_ms,
        } => {
            if url.is_empty() {
                return Err(MetadataError::Config(
                    "postgres config requires a connection url".to_string(),
                ));
            }
            tracing::info!("Connecting to PostgreSQL using connection URL");
            let store =
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
