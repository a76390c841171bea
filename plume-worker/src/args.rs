use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use plume_core::{AdapterId, DeviceMap};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Plume serverless Flux worker")]
pub struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "PLUME_CPU")]
    pub cpu: bool,

    /// Accelerator ordinal to bind the base model to
    #[arg(long, default_value_t = 0, env = "PLUME_GPU")]
    pub gpu: usize,

    /// Base model repository
    #[arg(long, default_value = "black-forest-labs/FLUX.1-dev", env = "PLUME_MODEL")]
    pub model: String,

    /// Hub cache holding the base weights and downloaded adapters
    #[arg(long, default_value = "/workspace/models", env = "PLUME_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Adapter repository bound when the base model loads
    #[arg(long, env = "PLUME_DEFAULT_ADAPTER_REPO", requires = "default_adapter_weight")]
    pub default_adapter_repo: Option<String>,

    /// Weight file inside the default adapter repository
    #[arg(long, env = "PLUME_DEFAULT_ADAPTER_WEIGHT", requires = "default_adapter_repo")]
    pub default_adapter_weight: Option<String>,

    /// Load the base model before accepting jobs instead of on the first job
    #[arg(long, env = "PLUME_EAGER_LOAD")]
    pub eager_load: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "PLUME_LOG_JSON")]
    pub log_json: bool,

    /// Run the job in this file once, print its output and exit
    #[arg(long, env = "PLUME_TEST_INPUT")]
    pub test_input: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1", env = "PLUME_HOST")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000, env = "PLUME_PORT")]
    pub port: u16,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::from_cpu_flag(self.cpu, self.gpu)
    }

    pub fn default_adapter(&self) -> Option<AdapterId> {
        match (&self.default_adapter_repo, &self.default_adapter_weight) {
            (Some(repo), Some(weight)) if !repo.is_empty() && !weight.is_empty() => {
                Some(AdapterId::new(repo, weight))
            }
            _ => None,
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["plume-worker"]);
        assert_eq!(args.model, "black-forest-labs/FLUX.1-dev");
        assert_eq!(args.cache_dir, PathBuf::from("/workspace/models"));
        assert_eq!(args.device_map(), DeviceMap::Ordinal(0));
        assert_eq!(args.default_adapter(), None);
        assert_eq!(args.listen_addr().unwrap().port(), 8000);
    }

    #[test]
    fn default_adapter_needs_both_parts() {
        let args = Args::parse_from([
            "plume-worker",
            "--default-adapter-repo",
            "acme/ink",
            "--default-adapter-weight",
            "ink.safetensors",
            "--cpu",
        ]);
        assert_eq!(
            args.default_adapter(),
            Some(AdapterId::new("acme/ink", "ink.safetensors"))
        );
        assert_eq!(args.device_map(), DeviceMap::ForceCpu);

        assert!(Args::try_parse_from(["plume-worker", "--default-adapter-repo", "acme/ink"]).is_err());
    }
}
