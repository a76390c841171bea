use std::future::Future;

use anyhow::Result;

use crate::ModelLike;

/// Builds the base model. Called at most once per [`crate::Session`].
pub trait Loader: Send + Sync + 'static {
    type Model: ModelLike;

    fn load(&self) -> impl Future<Output = Result<Self::Model>> + Send;
}
