//! Declarative job input schema.
//!
//! The accepted fields live in [`INPUT_SCHEMA`], a plain table of
//! [`FieldSpec`] rows. [`validate`] walks that table once, in declaration
//! order, and either returns the input with defaults filled in or the first
//! violation it finds.

use std::fmt;

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    /// Non-negative integer that fits in 64 bits
    UnsignedInt,
    /// Any JSON number; integers are coerced
    Float,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "integer",
            Self::UnsignedInt => "non-negative integer",
            Self::Float => "number",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDefault {
    Str(&'static str),
    Int(i64),
    Float(f64),
}

impl FieldDefault {
    fn to_value(self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.to_string()),
            Self::Int(i) => Value::Number(i.into()),
            Self::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        }
    }
}

/// Inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Range {
    Int(i64, i64),
    Float(f64, f64),
}

impl Range {
    fn contains(self, value: &Value) -> bool {
        match self {
            Self::Int(min, max) => value.as_i64().is_some_and(|v| (min..=max).contains(&v)),
            Self::Float(min, max) => value.as_f64().is_some_and(|v| (min..=max).contains(&v)),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(min, max) => write!(f, "[{min}, {max}]"),
            Self::Float(min, max) => write!(f, "[{min:?}, {max:?}]"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<FieldDefault>,
    pub range: Option<Range>,
    pub description: &'static str,
}

impl FieldSpec {
    const fn optional(name: &'static str, ty: FieldType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
            range: None,
            description,
        }
    }

    const fn with_default(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    const fn with_range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }
}

pub const INPUT_SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        name: "prompt",
        ty: FieldType::String,
        required: true,
        default: None,
        range: None,
        description: "The main text prompt describing the desired image",
    },
    FieldSpec::optional(
        "negative_prompt",
        FieldType::String,
        "Text prompt specifying concepts to exclude from the image",
    ),
    FieldSpec::optional("height", FieldType::Int, "Height of the generated image in pixels")
        .with_default(FieldDefault::Int(1024))
        .with_range(Range::Int(256, 2048)),
    FieldSpec::optional("width", FieldType::Int, "Width of the generated image in pixels")
        .with_default(FieldDefault::Int(1024))
        .with_range(Range::Int(256, 2048)),
    FieldSpec::optional("num_inference_steps", FieldType::Int, "Number of denoising steps")
        .with_default(FieldDefault::Int(28))
        .with_range(Range::Int(1, 100)),
    FieldSpec::optional("guidance_scale", FieldType::Float, "Guidance scale")
        .with_default(FieldDefault::Float(3.5))
        .with_range(Range::Float(0.0, 20.0)),
    FieldSpec::optional("num_images", FieldType::Int, "Number of images to generate per prompt")
        .with_default(FieldDefault::Int(1))
        .with_range(Range::Int(1, 4)),
    FieldSpec::optional("seed", FieldType::UnsignedInt, "Random seed for reproducibility"),
    FieldSpec::optional("aws_access_key_id", FieldType::String, "Access key id for S3 upload"),
    FieldSpec::optional(
        "aws_secret_access_key",
        FieldType::String,
        "Secret access key for S3 upload",
    ),
    FieldSpec::optional("aws_region", FieldType::String, "Region of the S3 bucket")
        .with_default(FieldDefault::Str("ap-south-1")),
    FieldSpec::optional("s3_bucket", FieldType::String, "Bucket receiving the generated images"),
    FieldSpec::optional("s3_prefix", FieldType::String, "Key prefix for uploaded images")
        .with_default(FieldDefault::Str("runpods_custom_faces")),
    FieldSpec::optional(
        "hf_token",
        FieldType::String,
        "Hugging Face token for private adapter repositories",
    ),
    FieldSpec::optional(
        "custom_lora_repo",
        FieldType::String,
        "Hugging Face repository holding the LoRA adapter",
    ),
    FieldSpec::optional(
        "custom_lora_weight_name",
        FieldType::String,
        "File name of the adapter weights inside the repository",
    )
    .with_default(FieldDefault::Str("lora.safetensors")),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    NotAnObject,
    Required,
    Type(FieldType),
    Range(Range),
    Malformed(String),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("job input must be a JSON object"),
            Self::Required => f.write_str("field is required"),
            Self::Type(ty) => write!(f, "expected {ty}"),
            Self::Range(range) => write!(f, "must be within {range}"),
            Self::Malformed(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid input field '{field}': {constraint}")]
pub struct ValidationError {
    pub field: String,
    pub constraint: Constraint,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, constraint: Constraint) -> Self {
        Self {
            field: field.into(),
            constraint,
        }
    }
}

/// Checks `input` against [`INPUT_SCHEMA`] and returns it normalized.
pub fn validate(input: &Value) -> Result<Map<String, Value>, ValidationError> {
    validate_with(INPUT_SCHEMA, input)
}

pub fn validate_with(
    schema: &[FieldSpec],
    input: &Value,
) -> Result<Map<String, Value>, ValidationError> {
    let raw = input
        .as_object()
        .ok_or_else(|| ValidationError::new("input", Constraint::NotAnObject))?;

    for key in raw.keys() {
        if !schema.iter().any(|spec| spec.name == key) {
            tracing::debug!(field = %key, "ignoring undeclared input field");
        }
    }

    let mut normalized = Map::new();
    for spec in schema {
        // `null` counts as absent.
        let value = match raw.get(spec.name).filter(|v| !v.is_null()) {
            Some(value) => check_field(spec, value)?,
            None if spec.required => {
                return Err(ValidationError::new(spec.name, Constraint::Required))
            }
            None => match spec.default {
                Some(default) => default.to_value(),
                None => continue,
            },
        };
        normalized.insert(spec.name.to_string(), value);
    }

    Ok(normalized)
}

fn check_field(spec: &FieldSpec, value: &Value) -> Result<Value, ValidationError> {
    let type_error = || ValidationError::new(spec.name, Constraint::Type(spec.ty));

    let value = match spec.ty {
        FieldType::String if value.is_string() => value.clone(),
        FieldType::Int if value.is_i64() || value.is_u64() => value.clone(),
        FieldType::UnsignedInt if value.is_u64() => value.clone(),
        FieldType::Float => value
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(type_error)?,
        _ => return Err(type_error()),
    };

    match spec.range {
        Some(range) if !range.contains(&value) => {
            Err(ValidationError::new(spec.name, Constraint::Range(range)))
        }
        _ => Ok(value),
    }
}
