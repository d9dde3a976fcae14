use std::sync::Arc;
use thiserror::Error;

/// Causes are shared behind `Arc` so workflow errors stay `Clone`: results
/// flow through shared in-flight futures, and every waiter gets the error.
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync>;

/// Workflow-level error taxonomy. Variants map onto HTTP statuses at the API
/// boundary via [`SyncError::status`].
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The requested novel/volume/chapter does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// The source served an anti-automation challenge instead of content.
    #[error("upstream blocked: {0}")]
    UpstreamBlocked(String),

    /// Transient fetch failure (connection, navigation, parse).
    #[error("fetch failed: {context}")]
    Fetch {
        context: String,
        #[source]
        cause: ErrorCause,
    },

    /// Local persistence failure.
    #[error("persistence failed: {context}")]
    Persistence {
        context: String,
        #[source]
        cause: ErrorCause,
    },
}

impl SyncError {
    pub fn fetch(
        context: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fetch {
            context: context.into(),
            cause: Arc::new(cause),
        }
    }

    pub fn persistence(
        context: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            context: context.into(),
            cause: Arc::new(cause),
        }
    }

    /// HTTP status this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::UpstreamBlocked(_) => 502,
            Self::Fetch { .. } => 500,
            Self::Persistence { .. } => 500,
        }
    }
}
