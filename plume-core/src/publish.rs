use std::io::Cursor;

use anyhow::Context;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{generate::GenerationResult, JobError, ObjectStore};

pub const CONTENT_TYPE: &str = "image/png";

/// Successful job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub images: Vec<String>,
    pub seed: u64,
    pub num_images: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_urls: Option<Vec<String>>,
    /// Same as `images[0]`, for single-image consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Where and how to upload one job's images.
pub struct Upload<'a> {
    pub store: &'a dyn ObjectStore,
    pub prefix: &'a str,
    /// Batch timestamp shared by every key of the job.
    pub timestamp: String,
}

impl<'a> Upload<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &'a str) -> Self {
        Self {
            store,
            prefix,
            timestamp: batch_timestamp(),
        }
    }
}

pub fn batch_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// `{prefix}/{timestamp}_{index}.png`; the index keeps keys unique within a batch.
pub fn object_key(prefix: &str, timestamp: &str, index: usize) -> String {
    format!("{prefix}/{timestamp}_{index}.png")
}

pub fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(bytes)
}

pub fn png_data_uri(png: &[u8]) -> String {
    format!("data:{CONTENT_TYPE};base64,{}", BASE64_STANDARD.encode(png))
}

/// Encodes every image and, when `upload` is given, stores it.
///
/// Uploads run one at a time in image order. A failed upload fails the job;
/// objects stored before it are left in place.
pub async fn publish(
    result: GenerationResult,
    upload: Option<Upload<'_>>,
) -> Result<JobOutput, JobError> {
    let mut images = Vec::with_capacity(result.images.len());
    let mut s3_urls = upload.as_ref().map(|_| Vec::with_capacity(result.images.len()));

    for (index, image) in result.images.iter().enumerate() {
        let png = encode_png(image).map_err(JobError::Publish)?;
        images.push(png_data_uri(&png));

        if let (Some(upload), Some(urls)) = (&upload, s3_urls.as_mut()) {
            let key = object_key(upload.prefix, &upload.timestamp, index);
            tracing::info!(index, %key, "uploading image");
            let url = upload
                .store
                .put_object(&key, png, CONTENT_TYPE)
                .await
                .map_err(JobError::Publish)?;
            urls.push(url);
        }
    }

    Ok(JobOutput {
        image_url: images.first().cloned(),
        num_images: images.len(),
        images,
        seed: result.seed,
        s3_urls: s3_urls.filter(|urls| !urls.is_empty()),
    })
}
