pub mod files;
pub mod keypages;
pub mod pages;
pub mod search;

use crate::error::ApiError;
use serde::Deserialize;

/// `?page=N` on paginated listings.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
}

impl PageQuery {
    pub fn number(&self) -> usize {
        self.page.unwrap_or(1)
    }
}

/// Run a core call on the blocking pool. Reads take the group lock, which a
/// mutation holds across fsync and the search index commit.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> wiki_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {}", e)))?
        .map_err(ApiError::from)
}
