//! # Pretrained Weight Descriptors and Fetchers
//!
//! This crate never downloads or caches anything; a [`WeightFetcher`]
//! turns a [`PretrainedWeightsDescriptor`] into a [`WeightMap`],
//! and is responsible for its own retries and caching.

use anyhow::bail;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tensors keyed by exact dotted parameter path.
///
/// Ordered, so that exports and error reports are stable.
pub type WeightMap = BTreeMap<String, TensorData>;

/// Static [`PretrainedWeightsDescriptor`] provider.
#[derive(Debug)]
pub struct StaticPretrainedWeightsDescriptor<'a> {
    /// Name of the weights.
    pub name: &'a str,

    /// Description of the weights.
    pub description: &'a str,

    /// License.
    pub license: Option<&'a str>,

    /// Source URL.
    pub origin: Option<&'a str>,

    /// URLs the weights may be fetched from, in preference order.
    pub urls: &'a [&'a str],
}

impl StaticPretrainedWeightsDescriptor<'_> {
    /// Convert to a [`PretrainedWeightsDescriptor`].
    pub fn to_descriptor(&self) -> PretrainedWeightsDescriptor {
        PretrainedWeightsDescriptor {
            name: self.name.to_string(),
            description: self.description.to_string(),
            license: self.license.map(|s| s.to_string()),
            origin: self.origin.map(|s| s.to_string()),
            urls: self.urls.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<&StaticPretrainedWeightsDescriptor<'_>> for PretrainedWeightsDescriptor {
    fn from(descriptor: &StaticPretrainedWeightsDescriptor) -> Self {
        descriptor.to_descriptor()
    }
}

/// A descriptor for a pretrained weights file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PretrainedWeightsDescriptor {
    /// Name of the weights.
    pub name: String,

    /// Description of the weights.
    pub description: String,

    /// License.
    pub license: Option<String>,

    /// Source URL.
    pub origin: Option<String>,

    /// URLs the weights may be fetched from, in preference order.
    pub urls: Vec<String>,
}

impl PretrainedWeightsDescriptor {
    /// The preferred URL.
    pub fn primary_url(&self) -> anyhow::Result<&str> {
        match self.urls.first() {
            Some(url) => Ok(url.as_str()),
            None => bail!("No URLs registered for weights: {}", self.name),
        }
    }

    /// Suggested cache file name for a fetcher; ``{name}-{url basename}``.
    pub fn cache_key(&self) -> anyhow::Result<String> {
        let url = self.primary_url()?;
        let base_name = url.rsplit_once('/').map_or(url, |(_, base)| base);
        Ok(format!("{}-{}", self.name, base_name))
    }
}

/// The pretrained weight fetch collaborator.
///
/// Implementations own networking, retries and caching.
pub trait WeightFetcher {
    /// Fetch the weights described by the descriptor.
    fn fetch(
        &self,
        descriptor: &PretrainedWeightsDescriptor,
    ) -> anyhow::Result<WeightMap>;
}

/// A [`WeightFetcher`] serving maps already held in memory.
///
/// Maps are keyed by descriptor name.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWeightFetcher {
    /// Weight maps, by descriptor name.
    pub items: BTreeMap<String, WeightMap>,
}

impl InMemoryWeightFetcher {
    /// Create an empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the map served for a descriptor name.
    pub fn with_weights(
        mut self,
        name: impl Into<String>,
        weights: WeightMap,
    ) -> Self {
        self.items.insert(name.into(), weights);
        self
    }
}

impl WeightFetcher for InMemoryWeightFetcher {
    fn fetch(
        &self,
        descriptor: &PretrainedWeightsDescriptor,
    ) -> anyhow::Result<WeightMap> {
        match self.items.get(&descriptor.name) {
            Some(weights) => Ok(weights.clone()),
            None => bail!("No weights held for: {}", descriptor.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: StaticPretrainedWeightsDescriptor = StaticPretrainedWeightsDescriptor {
        name: "my_model",
        description: "some description of my model.",
        license: Some("MIT"),
        origin: Some("https://github.com/my_org/my_model"),
        urls: &["https://example.com/models/my_model-abc123.pth", "bar"],
    };

    #[test]
    fn test_static_descriptor_to_descriptor() {
        let desc: PretrainedWeightsDescriptor = (&DESCRIPTOR).into();

        assert_eq!(desc.name, "my_model");
        assert_eq!(desc.description, DESCRIPTOR.description);
        assert_eq!(desc.license.as_deref(), Some("MIT"));
        assert_eq!(
            desc.urls,
            vec![
                "https://example.com/models/my_model-abc123.pth".to_string(),
                "bar".to_string()
            ]
        );
        assert_eq!(desc.cache_key().unwrap(), "my_model-my_model-abc123.pth");
    }

    #[test]
    fn test_descriptor_without_urls() {
        let desc = PretrainedWeightsDescriptor {
            urls: vec![],
            ..DESCRIPTOR.to_descriptor()
        };
        assert!(desc.primary_url().is_err());
        assert!(desc.cache_key().is_err());
    }

    #[test]
    fn test_in_memory_fetcher() {
        let mut weights = WeightMap::new();
        weights.insert("fc.bias".into(), TensorData::new(vec![1.0f32, 2.0], [2]));

        let fetcher = InMemoryWeightFetcher::new().with_weights("my_model", weights.clone());

        let fetched = fetcher.fetch(&DESCRIPTOR.to_descriptor()).unwrap();
        assert_eq!(fetched.len(), 1);
        fetched["fc.bias"].assert_eq(&weights["fc.bias"], true);

        let other = PretrainedWeightsDescriptor {
            name: "other".into(),
            ..DESCRIPTOR.to_descriptor()
        };
        let err = fetcher.fetch(&other).unwrap_err();
        assert!(err.to_string().contains("other"));
    }
}
