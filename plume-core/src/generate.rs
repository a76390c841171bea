use anyhow::anyhow;
use image::DynamicImage;

use crate::{GenerationRequest, JobError, JobInput, Loader, ModelLike, SessionGuard};

/// Images of one job, in model order, plus the seed that produced them.
#[derive(Debug)]
pub struct GenerationResult {
    pub images: Vec<DynamicImage>,
    pub seed: u64,
}

/// The explicit seed, or a fresh one in `[0, 2^32)`.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| u64::from(rand::random::<u32>()))
}

impl GenerationRequest {
    pub fn from_job(input: &JobInput, seed: u64) -> Self {
        Self {
            prompt: input.prompt.clone(),
            negative_prompt: input.negative_prompt.clone(),
            width: input.width,
            height: input.height,
            steps: input.num_inference_steps,
            guidance: input.guidance_scale,
            num_images: input.num_images,
            seed,
        }
    }
}

/// Invokes the model exactly once for `input`.
///
/// The base model must already be loaded through `guard`.
pub async fn generate<L: Loader>(
    guard: &mut SessionGuard<'_, L>,
    input: &JobInput,
) -> Result<GenerationResult, JobError> {
    let seed = resolve_seed(input.seed);
    let request = GenerationRequest::from_job(input, seed);
    let expected = request.num_images;

    tracing::info!(
        num_images = expected,
        seed,
        width = request.width,
        height = request.height,
        steps = request.steps,
        adapter = ?guard.bound_adapter(),
        "generating"
    );

    let images = guard
        .with_model(move |model| model.run(&request))
        .await
        .map_err(JobError::Generation)?;

    if images.len() != expected {
        return Err(JobError::Generation(anyhow!(
            "model returned {} images, expected {expected}",
            images.len()
        )));
    }

    Ok(GenerationResult { images, seed })
}
