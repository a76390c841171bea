//! Merging LoRA adapters into Flux transformer weights.
//!
//! Three layouts are understood, all resolved to the native (BFL) weight names:
//! kohya (`lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight`, with an
//! optional `.alpha`), PEFT on native names (`double_blocks.0.img_attn.qkv.lora_A.weight`)
//! and diffusers (`transformer_blocks.0.attn.to_q.lora_A.weight`), optionally under a
//! `transformer.` or `diffusion_model.` prefix. Diffusers splits the fused projections,
//! so its q/k/v (and the single blocks' mlp input) patch a row block of the fused weight.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use candle_core::{safetensors::MmapedSafetensors, DType, Device, Tensor};

const KOHYA_PREFIX: &str = "lora_unet_";
const MODULE_PREFIXES: &[&str] = &["model.diffusion_model.", "diffusion_model.", "transformer."];

/// Read access to the unpatched transformer weights.
pub(crate) trait BaseWeights {
    fn weight_names(&self) -> Vec<String>;

    /// Loads one weight onto the host.
    fn load_weight(&self, name: &str) -> Result<Tensor>;
}

impl BaseWeights for MmapedSafetensors {
    fn weight_names(&self) -> Vec<String> {
        self.tensors().into_iter().map(|(name, _)| name).collect()
    }

    fn load_weight(&self, name: &str) -> Result<Tensor> {
        Ok(self.load(name, &Device::Cpu)?)
    }
}

impl BaseWeights for HashMap<String, Tensor> {
    fn weight_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn load_weight(&self, name: &str) -> Result<Tensor> {
        self.get(name)
            .cloned()
            .with_context(|| format!("base weight '{name}' is missing"))
    }
}

enum Part {
    Down,
    Up,
    Alpha,
}

/// A base weight, or one row block of it. Block `n` starts at row `n * in_features`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Target {
    key: String,
    block: Option<usize>,
}

#[derive(Default)]
struct LoraPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

impl LoraPair {
    /// `scale · up·down` in f32.
    fn delta(self, target: &Target) -> Result<Tensor> {
        let (Some(down), Some(up)) = (self.down, self.up) else {
            bail!("adapter for '{}' lacks its down or up projection", target.key);
        };
        let rank = down.dim(0)?;
        let scale = self.alpha.map_or(1.0, |alpha| alpha / rank as f64);
        Ok((up.to_dtype(DType::F32)?.matmul(&down.to_dtype(DType::F32)?)? * scale)?)
    }
}

fn split_part(name: &str) -> Option<(&str, Part)> {
    [
        (".lora_down.weight", Part::Down),
        (".lora_A.weight", Part::Down),
        (".lora_up.weight", Part::Up),
        (".lora_B.weight", Part::Up),
        (".alpha", Part::Alpha),
    ]
    .into_iter()
    .find_map(|(suffix, part)| name.strip_suffix(suffix).map(|module| (module, part)))
}

/// Native name (and row block) of a diffusers module.
fn diffusers_target(module: &str) -> Option<(String, Option<usize>)> {
    if let Some(rest) = module.strip_prefix("transformer_blocks.") {
        let (index, sub) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        let (name, block) = match sub {
            "attn.to_q" => ("img_attn.qkv", Some(0)),
            "attn.to_k" => ("img_attn.qkv", Some(1)),
            "attn.to_v" => ("img_attn.qkv", Some(2)),
            "attn.add_q_proj" => ("txt_attn.qkv", Some(0)),
            "attn.add_k_proj" => ("txt_attn.qkv", Some(1)),
            "attn.add_v_proj" => ("txt_attn.qkv", Some(2)),
            "attn.to_out.0" => ("img_attn.proj", None),
            "attn.to_add_out" => ("txt_attn.proj", None),
            "ff.net.0.proj" => ("img_mlp.0", None),
            "ff.net.2" => ("img_mlp.2", None),
            "ff_context.net.0.proj" => ("txt_mlp.0", None),
            "ff_context.net.2" => ("txt_mlp.2", None),
            "norm1.linear" => ("img_mod.lin", None),
            "norm1_context.linear" => ("txt_mod.lin", None),
            _ => return None,
        };
        return Some((format!("double_blocks.{index}.{name}.weight"), block));
    }

    if let Some(rest) = module.strip_prefix("single_transformer_blocks.") {
        let (index, sub) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        let (name, block) = match sub {
            "attn.to_q" => ("linear1", Some(0)),
            "attn.to_k" => ("linear1", Some(1)),
            "attn.to_v" => ("linear1", Some(2)),
            "proj_mlp" => ("linear1", Some(3)),
            "proj_out" => ("linear2", None),
            "norm.linear" => ("modulation.lin", None),
            _ => return None,
        };
        return Some((format!("single_blocks.{index}.{name}.weight"), block));
    }

    let name = match module {
        "x_embedder" => "img_in",
        "context_embedder" => "txt_in",
        "time_text_embed.timestep_embedder.linear_1" => "time_in.in_layer",
        "time_text_embed.timestep_embedder.linear_2" => "time_in.out_layer",
        "time_text_embed.text_embedder.linear_1" => "vector_in.in_layer",
        "time_text_embed.text_embedder.linear_2" => "vector_in.out_layer",
        "time_text_embed.guidance_embedder.linear_1" => "guidance_in.in_layer",
        "time_text_embed.guidance_embedder.linear_2" => "guidance_in.out_layer",
        "proj_out" => "final_layer.linear",
        _ => return None,
    };
    Some((format!("{name}.weight"), None))
}

fn resolve(
    module: &str,
    names: &HashSet<String>,
    kohya_index: &HashMap<String, String>,
) -> Option<Target> {
    if let Some(flat) = module.strip_prefix(KOHYA_PREFIX) {
        return kohya_index.get(flat).map(|key| Target {
            key: key.clone(),
            block: None,
        });
    }

    let module = MODULE_PREFIXES
        .iter()
        .find_map(|prefix| module.strip_prefix(prefix))
        .unwrap_or(module);
    let native = format!("{module}.weight");
    if names.contains(&native) {
        return Some(Target {
            key: native,
            block: None,
        });
    }
    diffusers_target(module)
        .filter(|(key, _)| names.contains(key))
        .map(|(key, block)| Target { key, block })
}

/// Computes every base weight the adapter targets, patched with `scale · up·down`.
///
/// Only the patched weights are returned, in the base dtype and on the host;
/// everything else stays untouched in `base`. Adapter tensors that address no
/// base weight are skipped; an adapter that patches nothing is an error.
pub(crate) fn merge(
    base: &impl BaseWeights,
    adapter: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let names: HashSet<String> = base.weight_names().into_iter().collect();
    let kohya_index: HashMap<String, String> = names
        .iter()
        .filter_map(|key| {
            key.strip_suffix(".weight")
                .map(|module| (module.replace('.', "_"), key.clone()))
        })
        .collect();

    let mut pairs: HashMap<Target, LoraPair> = HashMap::new();
    let mut skipped = 0usize;
    for (name, tensor) in adapter {
        let Some((module, part)) = split_part(&name) else {
            skipped += 1;
            continue;
        };
        let Some(target) = resolve(module, &names, &kohya_index) else {
            skipped += 1;
            continue;
        };

        let pair = pairs.entry(target).or_default();
        match part {
            Part::Down => pair.down = Some(tensor),
            Part::Up => pair.up = Some(tensor),
            Part::Alpha => {
                let alpha = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                pair.alpha = alpha.first().copied();
            }
        }
    }

    if pairs.is_empty() {
        bail!("no adapter tensors match the base model ({skipped} tensors skipped)");
    }
    if skipped > 0 {
        tracing::warn!(skipped, "adapter tensors without a matching base weight");
    }

    let mut by_weight: BTreeMap<String, Vec<(Option<usize>, Tensor)>> = BTreeMap::new();
    for (target, pair) in pairs {
        let delta = pair.delta(&target)?;
        by_weight
            .entry(target.key)
            .or_default()
            .push((target.block, delta));
    }

    let mut patched = HashMap::with_capacity(by_weight.len());
    for (key, deltas) in by_weight {
        let weight = base.load_weight(&key)?;
        let (rows, cols) = weight
            .dims2()
            .with_context(|| format!("adapter targets '{key}', which is not a linear weight"))?;

        let mut merged = weight.to_dtype(DType::F32)?;
        for (block, delta) in deltas {
            let (delta_rows, delta_cols) = delta.dims2()?;
            let offset = block.map_or(0, |block| block * cols);
            let fits = match block {
                Some(_) => offset + delta_rows <= rows,
                None => delta_rows == rows,
            };
            if !fits || delta_cols != cols {
                bail!(
                    "adapter for '{key}' has shape {:?} at row {offset}, base weight has {:?}",
                    delta.dims(),
                    weight.dims()
                );
            }
            let delta = delta.pad_with_zeros(0, offset, rows - offset - delta_rows)?;
            merged = (merged + delta)?;
        }

        let merged = merged
            .to_dtype(weight.dtype())
            .with_context(|| format!("failed to merge adapter into '{key}'"))?;
        patched.insert(key, merged);
    }

    Ok(patched)
}
