use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::{DeviceMap, FluxLoader, FluxVariant};

impl FluxVariant {
    /// Detect the variant from a model identifier such as `black-forest-labs/FLUX.1-dev`.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if !name_upper.contains("FLUX") {
            return None;
        }
        if name_upper.contains("SCHNELL") {
            Some(Self::Schnell)
        } else {
            // dev is the only other published variant and the worker's default
            Some(Self::Dev)
        }
    }
}

/// Build a loader for `model_name`, detecting the variant from the name.
pub fn loader_for_model(
    model_name: &str,
    cache_dir: impl Into<PathBuf>,
    device_map: DeviceMap,
) -> Result<FluxLoader> {
    let variant = FluxVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {model_name}"))?;

    tracing::info!(model = model_name, ?variant, ?device_map, "configured base model");

    Ok(FluxLoader::new(model_name, variant, cache_dir, device_map))
}
