use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::schema::{self, Constraint, ValidationError};

/// A validated job, with every default applied.
#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    pub prompt: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub negative_prompt: Option<String>,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub num_images: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default, deserialize_with = "non_empty_secret")]
    pub aws_access_key_id: Option<SecretString>,
    #[serde(default, deserialize_with = "non_empty_secret")]
    pub aws_secret_access_key: Option<SecretString>,
    pub aws_region: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    #[serde(default, deserialize_with = "non_empty_secret")]
    pub hf_token: Option<SecretString>,
    #[serde(default, deserialize_with = "non_empty")]
    pub custom_lora_repo: Option<String>,
    pub custom_lora_weight_name: String,
}

/// Everything needed to talk to the bucket for one job.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub access_key_id: SecretString,
    pub secret_access_key: SecretString,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
}

/// Identity of a LoRA adapter: repository plus weight file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterId {
    pub repo: String,
    pub weight_name: String,
}

impl AdapterId {
    pub fn new(repo: impl Into<String>, weight_name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            weight_name: weight_name.into(),
        }
    }
}

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo, self.weight_name)
    }
}

impl JobInput {
    /// Validates raw job input against the schema and types it.
    pub fn from_value(input: &Value) -> Result<Self, ValidationError> {
        let normalized = schema::validate(input)?;
        serde_json::from_value(Value::Object(normalized))
            .map_err(|e| ValidationError::new("input", Constraint::Malformed(e.to_string())))
    }

    /// Upload target, only when key pair and bucket are all present.
    pub fn storage(&self) -> Option<StorageConfig> {
        match (
            &self.aws_access_key_id,
            &self.aws_secret_access_key,
            &self.s3_bucket,
        ) {
            (Some(access_key_id), Some(secret_access_key), Some(bucket)) => Some(StorageConfig {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                region: self.aws_region.clone(),
                bucket: bucket.clone(),
                prefix: self.s3_prefix.clone(),
            }),
            _ => None,
        }
    }

    pub fn adapter(&self) -> Option<AdapterId> {
        self.custom_lora_repo
            .as_ref()
            .map(|repo| AdapterId::new(repo.clone(), self.custom_lora_weight_name.clone()))
    }
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn non_empty_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(non_empty(deserializer)?.map(SecretString::from))
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;
    use serde_json::json;

    use super::*;

    #[test]
    fn typed_defaults() {
        let job = JobInput::from_value(&json!({ "prompt": "a cat" })).unwrap();
        assert_eq!(job.prompt, "a cat");
        assert_eq!((job.height, job.width), (1024, 1024));
        assert_eq!(job.num_inference_steps, 28);
        assert_eq!(job.guidance_scale, 3.5);
        assert_eq!(job.num_images, 1);
        assert_eq!(job.seed, None);
        assert!(job.storage().is_none());
        assert!(job.adapter().is_none());
    }

    #[test]
    fn storage_requires_key_pair_and_bucket() {
        let partial = JobInput::from_value(&json!({
            "prompt": "x",
            "aws_access_key_id": "AKIA",
            "s3_bucket": "images",
        }))
        .unwrap();
        assert!(partial.storage().is_none());

        let empty_secret = JobInput::from_value(&json!({
            "prompt": "x",
            "aws_access_key_id": "AKIA",
            "aws_secret_access_key": "",
            "s3_bucket": "images",
        }))
        .unwrap();
        assert!(empty_secret.storage().is_none());

        let full = JobInput::from_value(&json!({
            "prompt": "x",
            "aws_access_key_id": "AKIA",
            "aws_secret_access_key": "shh",
            "s3_bucket": "images",
            "aws_region": "eu-west-1",
        }))
        .unwrap();
        let storage = full.storage().unwrap();
        assert_eq!(storage.bucket, "images");
        assert_eq!(storage.region, "eu-west-1");
        assert_eq!(storage.prefix, "runpods_custom_faces");
        assert_eq!(storage.secret_access_key.expose_secret(), "shh");
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let job = JobInput::from_value(&json!({
            "prompt": "x",
            "hf_token": "hf_supersecret",
            "aws_secret_access_key": "aws_supersecret",
        }))
        .unwrap();
        let printed = format!("{job:?}");
        assert!(!printed.contains("hf_supersecret"));
        assert!(!printed.contains("aws_supersecret"));
    }

    #[test]
    fn adapter_uses_default_weight_name() {
        let job = JobInput::from_value(&json!({
            "prompt": "x",
            "custom_lora_repo": "acme/faces",
        }))
        .unwrap();
        assert_eq!(
            job.adapter(),
            Some(AdapterId::new("acme/faces", "lora.safetensors"))
        );
    }

    #[test]
    fn empty_adapter_repo_means_no_adapter() {
        let job = JobInput::from_value(&json!({ "prompt": "x", "custom_lora_repo": "" })).unwrap();
        assert!(job.adapter().is_none());
    }
}
