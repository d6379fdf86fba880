//! # Normalization Wrapper
//!
//! The pluggable normalization capability of the `ResNet` builders.
//!
//! Provides support for the ``burn::nn`` norm layers which normalize
//! ``[batch, channels, height, width]`` tensors over the channel dimension:
//! * [`Batch`](Normalization::Batch) - [`BatchNorm`]
//! * [`Group`](Normalization::Group) - [`GroupNorm`]
//! * [`Instance`](Normalization::Instance) - [`InstanceNorm`]
//!
//! A [`NormalizationConfig`] with any feature size acts as an abstract
//! constructor; every block re-sizes it with
//! [`NormalizationConfig::with_num_features`] to its own channel count.
//!
//! The enum is non-exhaustive, to prepare for future additions.

use crate::errors::{ResNetError, ResNetResult};
use burn::nn::{
    BatchNorm, BatchNormConfig, GroupNorm, GroupNormConfig, InstanceNorm, InstanceNormConfig,
};
use burn::prelude::{Backend, Config, Module, Tensor};

/// [`Normalization`] Configuration.
///
/// The enum is non-exhaustive to prepare for future additions.
#[derive(Config, Debug)]
#[non_exhaustive]
pub enum NormalizationConfig {
    /// [`BatchNorm`] Configuration.
    Batch(BatchNormConfig),

    /// [`GroupNorm`] Configuration.
    Group(GroupNormConfig),

    /// [`InstanceNorm`] Configuration.
    Instance(InstanceNormConfig),
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self::Batch(BatchNormConfig::new(0))
    }
}

impl From<BatchNormConfig> for NormalizationConfig {
    fn from(config: BatchNormConfig) -> Self {
        Self::Batch(config)
    }
}

impl From<GroupNormConfig> for NormalizationConfig {
    fn from(config: GroupNormConfig) -> Self {
        Self::Group(config)
    }
}

impl From<InstanceNormConfig> for NormalizationConfig {
    fn from(config: InstanceNormConfig) -> Self {
        Self::Instance(config)
    }
}

impl NormalizationConfig {
    /// Initialize a [`Normalization`] layer.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Normalization<B> {
        match self {
            NormalizationConfig::Batch(config) => config.init(device).into(),
            NormalizationConfig::Group(config) => config.init(device).into(),
            NormalizationConfig::Instance(config) => config.init(device).into(),
        }
    }

    /// Adjust a norm config to the feature size.
    pub fn with_num_features(
        self,
        num_features: usize,
    ) -> Self {
        match self {
            NormalizationConfig::Batch(config) => BatchNormConfig {
                num_features,
                ..config
            }
            .into(),
            NormalizationConfig::Group(config) => GroupNormConfig {
                num_channels: num_features,
                ..config
            }
            .into(),
            NormalizationConfig::Instance(config) => InstanceNormConfig {
                num_channels: num_features,
                ..config
            }
            .into(),
        }
    }

    /// Adjust a norm config to the feature size, checking that it fits.
    ///
    /// # Returns
    ///
    /// The resized config; or [`ResNetError::InvalidChannels`] when a group norm's
    /// ``num_groups`` does not divide ``num_features``.
    pub fn try_with_num_features(
        self,
        num_features: usize,
    ) -> ResNetResult<Self> {
        if let NormalizationConfig::Group(config) = &self {
            let num_groups = config.num_groups;
            if num_groups == 0 || num_features % num_groups != 0 {
                return Err(ResNetError::InvalidChannels(format!(
                    "group norm num_groups={num_groups} does not divide num_features={num_features}"
                )));
            }
        }
        Ok(self.with_num_features(num_features))
    }

    /// Get the number of features.
    pub fn num_features(&self) -> usize {
        match self {
            NormalizationConfig::Batch(config) => config.num_features,
            NormalizationConfig::Group(config) => config.num_channels,
            NormalizationConfig::Instance(config) => config.num_channels,
        }
    }
}

/// Normalization Layer Wrapper
///
/// See [`NormalizationConfig`].
#[derive(Module, Debug)]
#[non_exhaustive]
pub enum Normalization<B: Backend> {
    /// [`BatchNorm`] layer; restricted to `BatchNorm`<2>.
    Batch(BatchNorm<B, 2>),

    /// [`GroupNorm`] layer.
    Group(GroupNorm<B>),

    /// [`InstanceNorm`] layer.
    Instance(InstanceNorm<B>),
}

impl<B: Backend> From<BatchNorm<B, 2>> for Normalization<B> {
    fn from(layer: BatchNorm<B, 2>) -> Self {
        Self::Batch(layer)
    }
}

impl<B: Backend> From<GroupNorm<B>> for Normalization<B> {
    fn from(layer: GroupNorm<B>) -> Self {
        Self::Group(layer)
    }
}

impl<B: Backend> From<InstanceNorm<B>> for Normalization<B> {
    fn from(layer: InstanceNorm<B>) -> Self {
        Self::Instance(layer)
    }
}

impl<B: Backend> Normalization<B> {
    /// Applies normalization to a tensor.
    ///
    /// The output has the same shape as the input.
    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self {
            Normalization::Batch(norm) => norm.forward(input),
            Normalization::Group(norm) => norm.forward(input),
            Normalization::Instance(norm) => norm.forward(input),
        }
    }

    /// Get the number of features.
    pub fn num_features(&self) -> usize {
        match self {
            Normalization::Batch(norm) => norm.gamma.shape().dims[0],
            Normalization::Group(norm) => norm.num_channels,
            Normalization::Instance(norm) => norm.num_channels,
        }
    }

    /// The learnable scale (``gamma``), if the layer is affine.
    pub fn scale(&self) -> Option<Tensor<B, 1>> {
        match self {
            Normalization::Batch(norm) => Some(norm.gamma.val()),
            Normalization::Group(norm) => norm.gamma.as_ref().map(|gamma| gamma.val()),
            Normalization::Instance(norm) => norm.gamma.as_ref().map(|gamma| gamma.val()),
        }
    }

    /// The learnable bias (``beta``), if the layer is affine.
    pub fn bias(&self) -> Option<Tensor<B, 1>> {
        match self {
            Normalization::Batch(norm) => Some(norm.beta.val()),
            Normalization::Group(norm) => norm.beta.as_ref().map(|beta| beta.val()),
            Normalization::Instance(norm) => norm.beta.as_ref().map(|beta| beta.val()),
        }
    }

    /// Zero the learnable scale (``gamma``).
    ///
    /// Non-affine layers have no scale, and are left unchanged.
    pub fn zero_scale(&mut self) {
        match self {
            Normalization::Batch(norm) => {
                norm.gamma = norm.gamma.clone().map(|gamma| gamma.zeros_like());
            }
            Normalization::Group(norm) => {
                norm.gamma = norm
                    .gamma
                    .take()
                    .map(|gamma| gamma.map(|g| g.zeros_like()));
            }
            Normalization::Instance(norm) => {
                norm.gamma = norm
                    .gamma
                    .take()
                    .map(|gamma| gamma.map(|g| g.zeros_like()));
            }
        }
    }
}
