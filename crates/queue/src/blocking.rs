//! Offload synchronous store calls from async tasks

use crate::error::QueueError;
use std::sync::Arc;

/// Run `f` against `store` on tokio's blocking pool
pub(crate) async fn with_store<S, T, F>(store: &Arc<S>, f: F) -> Result<T, QueueError>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, QueueError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store)).await?
}
