use thiserror::Error;

use crate::schema::ValidationError;

pub type Result<T> = std::result::Result<T, JobError>;

/// Everything that can end a job early.
///
/// Every kind is answered to the caller as `{ "error": "<message>" }`; only
/// [`JobError::Initialization`] additionally takes the worker down.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed or out-of-range job input, rejected before any resource is touched
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The base model could not be loaded
    #[error("failed to initialize base model: {0:#}")]
    Initialization(anyhow::Error),

    /// The requested adapter could not be fetched or attached
    #[error("failed to load adapter '{repo}': {source:#}")]
    AdapterLoad {
        repo: String,
        #[source]
        source: anyhow::Error,
    },

    /// The model invocation itself failed
    #[error("image generation failed: {0:#}")]
    Generation(anyhow::Error),

    /// Encoding or upload failed after the images were produced
    #[error("failed to publish results: {0:#}")]
    Publish(anyhow::Error),
}

impl JobError {
    /// Whether the worker process is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization(_))
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Initialization(_) => "initialization",
            Self::AdapterLoad { .. } => "adapter_load",
            Self::Generation(_) => "generation",
            Self::Publish(_) => "publish",
        }
    }
}
