use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::{
    generate::generate,
    publish::{publish, JobOutput, Upload},
    JobError, JobInput, Loader, Session, StorageConnector,
};

/// What the caller sees: the full payload or a single error string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Success(JobOutput),
    Failure { error: String },
}

impl From<Result<JobOutput, JobError>> for JobResponse {
    fn from(result: Result<JobOutput, JobError>) -> Self {
        match result {
            Ok(output) => Self::Success(output),
            Err(e) => Self::Failure {
                error: e.to_string(),
            },
        }
    }
}

/// Runs jobs end to end against one session.
pub struct JobHandler<L: Loader> {
    session: Session<L>,
    storage: Arc<dyn StorageConnector>,
}

impl<L: Loader> JobHandler<L> {
    pub fn new(session: Session<L>, storage: Arc<dyn StorageConnector>) -> Self {
        Self { session, storage }
    }

    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    /// Validates, generates and publishes one job.
    pub async fn run(&self, job_id: &str, input: &Value) -> Result<JobOutput, JobError> {
        let span = tracing::info_span!("job", id = %job_id);
        let result = self.run_inner(input).instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(output) => tracing::info!(
                num_images = output.num_images,
                uploaded = output.s3_urls.is_some(),
                "job completed"
            ),
            Err(e) => tracing::error!(kind = e.kind(), fatal = e.is_fatal(), "job failed: {e}"),
        }
        result
    }

    async fn run_inner(&self, input: &Value) -> Result<JobOutput, JobError> {
        let input = JobInput::from_value(input)?;

        let result = {
            let mut guard = self.session.lock().await;
            guard.ensure_base_loaded().await?;
            if let Some(adapter) = input.adapter() {
                guard
                    .ensure_adapter_loaded(&adapter, input.hf_token.as_ref())
                    .await?;
            }
            generate(&mut guard, &input).await?
        };

        match input.storage() {
            Some(config) => {
                let store = self
                    .storage
                    .connect(&config)
                    .await
                    .context("failed to open object storage")
                    .map_err(JobError::Publish)?;
                publish(result, Some(Upload::new(store.as_ref(), &config.prefix))).await
            }
            None => publish(result, None).await,
        }
    }
}
