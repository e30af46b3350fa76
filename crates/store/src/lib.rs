//! Contact store implementations for identra.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use identra_config::DatabaseConfig;
use identra_core::{ContactStore, StoreError};
use std::sync::Arc;
use tracing::info;

/// Open the backend named by `config.backend`, migrating it when
/// `run_migrations` is set.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn ContactStore>, StoreError> {
    let store: Arc<dyn ContactStore> = match config.backend.as_str() {
        "memory" => Arc::new(InMemoryStore::with_lock_timeout(config.lock_timeout())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            ensure_sqlite_parent(&config.url).await?;
            Arc::new(SqliteStore::connect(config).await?)
        }
        #[cfg(feature = "postgres")]
        "postgres" => Arc::new(PostgresStore::connect(config).await?),
        other => {
            return Err(StoreError::Unavailable(format!(
                "store backend '{other}' is not compiled into this build"
            )));
        }
    };

    if config.run_migrations {
        store.migrate().await?;
    }

    info!(backend = store.name(), "Contact store ready");
    Ok(store)
}

/// SQLite creates the file but not its directory.
#[cfg(feature = "sqlite")]
async fn ensure_sqlite_parent(url: &str) -> Result<(), StoreError> {
    let Some(path) = sqlite_file_path(url) else {
        return Ok(());
    };
    match std::path::Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("cannot create {}: {e}", dir.display()))),
        _ => Ok(()),
    }
}

/// The file path of a `sqlite:` url, or `None` for in-memory databases.
#[cfg(feature = "sqlite")]
fn sqlite_file_path(url: &str) -> Option<&str> {
    if url.contains(":memory:") {
        return None;
    }
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty()).then_some(path)
}
