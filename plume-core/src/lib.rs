#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod error;
pub mod generate;
pub mod handler;
pub mod hub;
pub mod job;
pub mod loader;
mod loader_factory;
pub mod publish;
pub mod schema;
pub mod session;
pub mod storage;
mod util;

mod flux;

use std::path::Path;

pub use device_map::*;
pub use error::{JobError, Result};
pub use flux::{FluxLoader, FluxModel, FluxVariant};
pub use handler::{JobHandler, JobResponse};
pub use hub::{AdapterFetcher, HubFetcher};
pub use job::{AdapterId, JobInput, StorageConfig};
pub use loader::*;
pub use loader_factory::*;
pub use publish::JobOutput;
pub use session::{Session, SessionGuard};
pub use storage::{ObjectStore, S3Connector, StorageConnector};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// One model invocation: everything the model needs to produce a batch.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub num_images: usize,
    pub seed: u64,
}

/// A loaded text2image model that can take a swappable adapter.
///
/// Implementations do blocking work; callers run them off the async runtime.
pub trait ModelLike: Send + 'static {
    /// Produces exactly `request.num_images` images, in order.
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;

    /// Attaches the adapter stored at `weights`, replacing any previous one.
    fn attach_adapter(&mut self, weights: &Path) -> anyhow::Result<()>;
}
