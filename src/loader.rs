//! Safetensors weight loading with name-mapping support.
//!
//! Published VidTok checkpoints use the reference module tree
//! (`encoder.down.0.block.0.conv1.conv.weight`, ...); this loader reads a
//! single safetensors file into a `VarBuilder`, applying optional
//! exact/prefix/suffix renames on the way in, and can validate that a set of
//! required tensors is present.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

/// Errors that can occur while loading configs or weights.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required tensors: {missing:?}")]
    MissingTensors { missing: Vec<String> },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// A single tensor-name rewrite rule.
#[derive(Debug, Clone)]
enum MappingRule {
    Exact { from: String, to: String },
    Prefix { from: String, to: String },
    Suffix { from: String, to: String },
}

impl MappingRule {
    fn apply(&self, name: &str) -> Option<String> {
        match self {
            Self::Exact { from, to } => (name == from).then(|| to.clone()),
            Self::Prefix { from, to } => name
                .strip_prefix(from.as_str())
                .map(|rest| format!("{to}{rest}")),
            Self::Suffix { from, to } => name
                .strip_suffix(from.as_str())
                .map(|rest| format!("{rest}{to}")),
        }
    }
}

/// Loads safetensors weights into a [`VarBuilder`], renaming tensors
/// according to the configured rules. Rules are applied in order; the first
/// matching rule of each kind rewrites the name.
#[derive(Debug)]
pub struct WeightLoader {
    device: Device,
    dtype: DType,
    rules: Vec<MappingRule>,
}

impl WeightLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            rules: Vec::new(),
        }
    }

    pub fn add_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(MappingRule::Exact {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn add_prefix_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(MappingRule::Prefix {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn add_suffix_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(MappingRule::Suffix {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Apply all rules to a tensor name.
    pub fn map_name(&self, name: &str) -> String {
        let mut name = name.to_string();
        for rule in &self.rules {
            if let Some(mapped) = rule.apply(&name) {
                name = mapped;
            }
        }
        name
    }

    /// Read a safetensors file into a `VarBuilder` with mapped names.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<VarBuilder<'static>, LoaderError> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &self.device)?;
        let mapped = self.map_tensors(tensors)?;
        Ok(VarBuilder::from_tensors(mapped, self.dtype, &self.device))
    }

    fn map_tensors(
        &self,
        tensors: HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>, LoaderError> {
        let mut mapped = HashMap::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            mapped.insert(self.map_name(&name), tensor.to_dtype(self.dtype)?);
        }
        Ok(mapped)
    }
}

/// Check that every expected tensor name is present, returning the missing
/// ones.
pub fn validate_tensor_names(expected: &[String], actual: &[&str]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !actual.contains(&name.as_str()))
        .cloned()
        .collect()
}

/// Parse a JSON config file into any deserializable type.
pub fn load_json_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| LoaderError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LoaderError::JsonParse {
        path: path.display().to_string(),
        source,
    })
}
