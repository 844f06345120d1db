use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] booksync::SyncError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("output closed: {0}")]
    Io(#[from] std::io::Error),
}
