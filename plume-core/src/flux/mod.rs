use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error, Result};
use candle_core::{safetensors::MmapedSafetensors, DType, Device, IndexOp, Shape, Tensor};
use candle_nn::{var_builder::SimpleBackend, Init, Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::Cache;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

mod lora;

use crate::{
    hub::cached_file, select_best_device, tensor_to_image, DeviceMap, GenerationRequest, Loader,
    ModelLike,
};

const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";
const T5_MAX_TOKENS: usize = 256;
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Dev,
    Schnell,
}

impl FluxVariant {
    fn transformer_file(self) -> &'static str {
        match self {
            Self::Dev => "flux1-dev.safetensors",
            Self::Schnell => "flux1-schnell.safetensors",
        }
    }

    fn transformer_config(self) -> model::Config {
        match self {
            Self::Dev => model::Config::dev(),
            Self::Schnell => model::Config::schnell(),
        }
    }

    fn autoencoder_config(self) -> autoencoder::Config {
        match self {
            Self::Dev => autoencoder::Config::dev(),
            Self::Schnell => autoencoder::Config::schnell(),
        }
    }

    /// Dev is trained with a resolution-dependent timestep shift, schnell is not.
    fn schedule(self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
            Self::Schnell => sampling::get_schedule(steps, None),
        }
    }
}

pub struct FluxModel {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    /// `None` only after a swap failed to rebuild and to restore the transformer.
    flux_model: Option<Flux>,
    /// Pristine transformer weights; adapters are always merged onto these.
    flux_file: PathBuf,
    /// Adapter-patched tensors of the current transformer, kept on the host.
    patched: HashMap<String, Tensor>,
}

impl FluxModel {
    fn text_embeddings(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        Ok((t5_emb, clip_emb))
    }

    fn generate_one(
        &self,
        flux_model: &Flux,
        t5_emb: &Tensor,
        clip_emb: &Tensor,
        request: &GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<DynamicImage> {
        let noise_img = seeded_noise(rng, request.height, request.width, &self.device)?
            .to_dtype(self.dtype)?;

        let state = sampling::State::new(t5_emb, clip_emb, &noise_img)?;
        let timesteps = self.variant.schedule(request.steps, state.img.dim(1)?);

        let latent_img = sampling::denoise(
            flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            request.guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, request.height, request.width)?;
        let decoded = self.autoencoder.decode(&unpacked)?;

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn base_weights(&self) -> Result<MmapedSafetensors> {
        let base = unsafe { MmapedSafetensors::new(&self.flux_file) }
            .context("failed to map base transformer weights")?;
        Ok(base)
    }
}

fn build_transformer(
    variant: FluxVariant,
    base: MmapedSafetensors,
    patched: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<Flux> {
    let vb = VarBuilder::from_backend(
        Box::new(PatchedWeights { base, patched }),
        dtype,
        device.clone(),
    );
    Ok(Flux::new(&variant.transformer_config(), vb)?)
}

impl ModelLike for FluxModel {
    fn run(&mut self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        if request.negative_prompt.is_some() {
            tracing::debug!("flux is guidance distilled, negative prompt is not applied");
        }

        let (t5_emb, clip_emb) = self.text_embeddings(&request.prompt)?;
        let flux_model = self
            .flux_model
            .as_ref()
            .context("transformer is unavailable after a failed adapter swap")?;

        // One stream per job: image i of a batch is reproducible from the seed alone.
        let mut rng = StdRng::seed_from_u64(request.seed);
        (0..request.num_images)
            .map(|index| {
                tracing::debug!(index, "denoising");
                self.generate_one(flux_model, &t5_emb, &clip_emb, request, &mut rng)
            })
            .collect()
    }

    fn attach_adapter(&mut self, weights: &Path) -> Result<()> {
        let adapter = candle_core::safetensors::load(weights, &Device::Cpu)
            .with_context(|| format!("failed to read adapter weights {}", weights.display()))?;
        let base = self.base_weights()?;
        let patched = lora::merge(&base, adapter)?;
        let count = patched.len();

        // Free the current transformer first so two copies never coexist on the device.
        self.flux_model = None;
        let rebuilt = build_transformer(
            self.variant,
            base,
            patched.clone(),
            self.dtype,
            &self.device,
        );
        match rebuilt {
            Ok(flux_model) => {
                self.flux_model = Some(flux_model);
                self.patched = patched;
                tracing::info!(patched = count, "adapter merged into transformer");
                Ok(())
            }
            Err(e) => {
                let restored = build_transformer(
                    self.variant,
                    self.base_weights()?,
                    self.patched.clone(),
                    self.dtype,
                    &self.device,
                )
                .context("failed to restore transformer after a failed adapter swap")?;
                self.flux_model = Some(restored);
                Err(e.context("failed to rebuild flux model with adapter"))
            }
        }
    }
}

/// Transformer weights: adapter-patched tensors laid over the mmaped base file.
struct PatchedWeights {
    base: MmapedSafetensors,
    patched: HashMap<String, Tensor>,
}

impl SimpleBackend for PatchedWeights {
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        match self.patched.get(name) {
            Some(tensor) => {
                if tensor.shape() != &s {
                    candle_core::bail!(
                        "shape mismatch for {name}, expected {s:?}, got {:?}",
                        tensor.shape()
                    );
                }
                tensor.to_device(dev)?.to_dtype(dtype)
            }
            None => SimpleBackend::get(&self.base, s, name, h, dtype, dev),
        }
    }

    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> candle_core::Result<Tensor> {
        match self.patched.get(name) {
            Some(tensor) => tensor.to_device(dev)?.to_dtype(dtype),
            None => SimpleBackend::get_unchecked(&self.base, name, dtype, dev),
        }
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.patched.contains_key(name) || SimpleBackend::contains_tensor(&self.base, name)
    }
}

/// Standard normal latent noise drawn from `rng`, shaped like `sampling::get_noise`.
fn seeded_noise(rng: &mut StdRng, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let data: Vec<f32> = rng
        .sample_iter(StandardNormal)
        .take(16 * height * width)
        .collect();
    Ok(Tensor::from_vec(data, (1, 16, height, width), device)?)
}

/// Builds a [`FluxModel`] purely from the local weight cache.
#[derive(Debug, Clone)]
pub struct FluxLoader {
    model_id: String,
    variant: FluxVariant,
    cache_dir: PathBuf,
    device_map: DeviceMap,
}

impl FluxLoader {
    pub fn new(
        model_id: impl Into<String>,
        variant: FluxVariant,
        cache_dir: impl Into<PathBuf>,
        device_map: DeviceMap,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            variant,
            cache_dir: cache_dir.into(),
            device_map,
        }
    }

    fn load_blocking(&self) -> Result<FluxModel> {
        // Configure device.
        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        let cache = Cache::new(self.cache_dir.clone());
        tracing::info!(?device, ?dtype, cache = %self.cache_dir.display(), "loading flux components");

        // --- Load T5 Model and Tokenizer ---
        let t5_model_file = cached_file(&cache, T5_REPO, Some(T5_REVISION), "model.safetensors")?;
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = cached_file(&cache, T5_REPO, Some(T5_REVISION), "config.json")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = cached_file(&cache, T5_TOKENIZER_REPO, None, T5_TOKENIZER_FILE)?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_model_file = cached_file(&cache, CLIP_REPO, None, "model.safetensors")?;
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = cached_file(&cache, CLIP_REPO, None, "tokenizer.json")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let autoencoder_model_file = cached_file(&cache, &self.model_id, None, "ae.safetensors")?;
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[autoencoder_model_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&self.variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load Flux Model (non-quantized) ---
        let flux_file =
            cached_file(&cache, &self.model_id, None, self.variant.transformer_file())?;
        let flux_base = unsafe { MmapedSafetensors::new(&flux_file) }
            .context("failed to map flux weights")?;
        let flux_model = build_transformer(self.variant, flux_base, HashMap::new(), dtype, &device)
            .context("failed to load flux model")?;

        Ok(FluxModel {
            device,
            dtype,
            variant: self.variant,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model: Some(flux_model),
            flux_file,
            patched: HashMap::new(),
        })
    }
}

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(&self) -> Result<Self::Model> {
        let loader = self.clone();
        tokio::task::spawn_blocking(move || loader.load_blocking())
            .await
            .context("model loading task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_reproducible_from_seed() {
        let a = seeded_noise(&mut StdRng::seed_from_u64(42), 256, 256, &Device::Cpu).unwrap();
        let b = seeded_noise(&mut StdRng::seed_from_u64(42), 256, 256, &Device::Cpu).unwrap();
        let c = seeded_noise(&mut StdRng::seed_from_u64(43), 256, 256, &Device::Cpu).unwrap();

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn noise_matches_latent_shape() {
        let noise = seeded_noise(&mut StdRng::seed_from_u64(0), 1024, 768, &Device::Cpu).unwrap();
        assert_eq!(noise.dims(), &[1, 16, 128, 96]);

        // Sizes that are not multiples of 16 round up, like the sampler does.
        let noise = seeded_noise(&mut StdRng::seed_from_u64(0), 260, 300, &Device::Cpu).unwrap();
        assert_eq!(noise.dims(), &[1, 16, 34, 38]);
    }

    #[test]
    fn noise_is_roughly_standard_normal() {
        let noise = seeded_noise(&mut StdRng::seed_from_u64(7), 256, 256, &Device::Cpu).unwrap();
        let samples = noise.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn patched_tensors_shadow_the_mapped_file() {
        let dir = std::env::temp_dir().join(format!("plume-patched-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("transformer.safetensors");
        let qkv = "double_blocks.0.img_attn.qkv.weight";
        let proj = "double_blocks.0.img_attn.proj.weight";
        let on_disk = HashMap::from([
            (qkv.to_string(), Tensor::zeros((6, 2), DType::F32, &Device::Cpu).unwrap()),
            (proj.to_string(), Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap()),
        ]);
        candle_core::safetensors::save(&on_disk, &file).unwrap();
        let base = unsafe { MmapedSafetensors::new(&file) }.unwrap();

        let adapter = HashMap::from([
            (
                "transformer.transformer_blocks.0.attn.to_q.lora_A.weight".to_string(),
                Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap(),
            ),
            (
                "transformer.transformer_blocks.0.attn.to_q.lora_B.weight".to_string(),
                Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap(),
            ),
        ]);
        let patched = lora::merge(&base, adapter).unwrap();
        assert_eq!(patched.keys().collect::<Vec<_>>(), vec![qkv]);

        let vb = VarBuilder::from_backend(
            Box::new(PatchedWeights { base, patched }),
            DType::F32,
            Device::Cpu,
        );
        let merged = vb.get((6, 2), qkv).unwrap().flatten_all().unwrap();
        assert_eq!(
            merged.to_vec1::<f32>().unwrap(),
            vec![1., 1., 1., 1., 0., 0., 0., 0., 0., 0., 0., 0.]
        );
        let untouched = vb.get((2, 2), proj).unwrap().flatten_all().unwrap();
        assert_eq!(untouched.to_vec1::<f32>().unwrap(), vec![1.; 4]);
        assert!(vb.get((3, 3), qkv).is_err());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn variant_files() {
        assert_eq!(FluxVariant::Dev.transformer_file(), "flux1-dev.safetensors");
        assert_eq!(FluxVariant::Schnell.transformer_file(), "flux1-schnell.safetensors");
    }

    #[test]
    fn dev_schedule_is_shifted() {
        let dev = FluxVariant::Dev.schedule(4, 4096);
        let schnell = FluxVariant::Schnell.schedule(4, 4096);
        assert_eq!(dev.len(), 5);
        assert_eq!(schnell, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
        assert!(dev[2] > schnell[2]);
    }

    #[tokio::test]
    async fn empty_cache_fails_to_load() {
        let loader = FluxLoader::new(
            "black-forest-labs/FLUX.1-dev",
            FluxVariant::Dev,
            std::env::temp_dir().join("plume-no-weights"),
            DeviceMap::ForceCpu,
        );
        let err = loader.load().await.err().expect("load should fail");
        assert!(format!("{err:#}").contains("is not in the weight cache"));
    }
}
