//! # The `ResNet` Projection Shortcut.
//!
//! ``conv1x1(in, out, stride) -> norm``; no activation.

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors, join_path};
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::errors::{ResNetError, ResNetResult};
use crate::layers::conv::conv1x1;
use crate::models::resnet::util::stride_div_output_resolution;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::conv::Conv2d;
use burn::prelude::{Backend, Config, Module, Tensor};

/// Does a block changing `in_planes -> out_planes` at `stride` need a projection shortcut?
pub fn needs_projection(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
) -> bool {
    stride != 1 || in_planes != out_planes
}

/// Check that a block's shortcut is compatible with its transform path.
///
/// A projection is required iff [`needs_projection`]; when present,
/// it must map exactly `in_planes -> out_planes` at `stride`.
/// A projection on a shape-preserving block is permitted.
pub fn check_shortcut(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    downsample: Option<&ConvDownsampleConfig>,
) -> ResNetResult<()> {
    match downsample {
        None if needs_projection(in_planes, out_planes, stride) => {
            Err(ResNetError::InvalidShortcut(format!(
                "block maps {in_planes} -> {out_planes} planes at stride={stride}, but has no projection shortcut"
            )))
        }
        None => Ok(()),
        Some(ds)
            if ds.in_channels != in_planes
                || ds.out_channels != out_planes
                || ds.stride != stride =>
        {
            Err(ResNetError::InvalidShortcut(format!(
                "projection maps {} -> {} planes at stride={}, block maps {in_planes} -> {out_planes} at stride={stride}",
                ds.in_channels, ds.out_channels, ds.stride
            )))
        }
        Some(ds) => ds.try_validate(),
    }
}

/// [`ConvDownsample`] Meta trait.
pub trait ConvDownsampleMeta {
    /// The size of the in channels dimension.
    fn in_channels(&self) -> usize;

    /// The size of the out channels dimension.
    fn out_channels(&self) -> usize;

    /// The stride of the downsample layer.
    fn stride(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    ///
    /// # Returns
    ///
    /// ``[ceil(in_height / stride), ceil(in_width / stride)]``
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`ConvDownsample`] configuration.
#[derive(Config, Debug)]
pub struct ConvDownsampleConfig {
    /// The size of the in channels dimension.
    pub in_channels: usize,

    /// The size of the out channels dimension.
    pub out_channels: usize,

    /// The stride of the downsample layer.
    #[config(default = 1)]
    pub stride: usize,

    /// The norm layer config; resized to `out_channels` on init.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,
}

impl ConvDownsampleMeta for ConvDownsampleConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl ConvDownsampleConfig {
    /// Check the channel and stride values.
    pub fn try_validate(&self) -> ResNetResult<()> {
        conv1x1(self.in_channels, self.out_channels, self.stride)?;
        self.normalization
            .clone()
            .try_with_num_features(self.out_channels)?;
        Ok(())
    }

    /// Initialize a [`ConvDownsample`] `Module`.
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<ConvDownsample<B>> {
        let conv = conv1x1(self.in_channels, self.out_channels, self.stride)?;
        Ok(ConvDownsample {
            conv: conv.init(device),
            norm: self
                .normalization
                .clone()
                .try_with_num_features(self.out_channels)?
                .init(device),
        })
    }
}

/// Projection shortcut; a strided 1x1 conv followed by a norm.
///
/// Maps ``[batch, in_channels, in_height, in_width]`` to
/// ``[batch, out_channels, out_height, out_width]`` tensors.
#[derive(Module, Debug)]
pub struct ConvDownsample<B: Backend> {
    /// Projection conv.
    pub conv: Conv2d<B>,

    /// Norm.
    pub norm: Normalization<B>,
}

impl<B: Backend> ConvDownsampleMeta for ConvDownsample<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1]
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> usize {
        self.conv.stride[0]
    }
}

impl<B: Backend> ConvDownsample<B> {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: a ``[batch, in_channels, in_height, in_width]`` tensor.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_channels, ceil(in_height/stride), ceil(in_width/stride)]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, in_height, in_width] = unpack_shape_contract!(
            ["batch", "in_channels", "in_height", "in_width"],
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_channels", self.in_channels())]
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let out = self.conv.forward(input);
        let out = self.norm.forward(out);

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &out,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        out
    }
}

/// ``torchvision`` holds the shortcut as a sequence: ``0`` is the conv, ``1`` the norm.
impl<B: Backend> NamedTensors<B> for ConvDownsample<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        self.conv.visit_named(&join_path(prefix, "0"), visitor);
        self.norm.visit_named(&join_path(prefix, "1"), visitor);
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.conv = self.conv.map_named(&join_path(prefix, "0"), mapper);
        self.norm = self.norm.map_named(&join_path(prefix, "1"), mapper);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::nn::GroupNormConfig;
    use burn::tensor::Distribution;

    #[test]
    fn test_downsample_config() {
        let config = ConvDownsampleConfig::new(64, 256).with_stride(2);
        assert_eq!(config.in_channels(), 64);
        assert_eq!(config.out_channels(), 256);
        assert_eq!(config.stride(), 2);
        assert_eq!(config.output_resolution([7, 8]), [4, 4]);
        assert!(config.try_validate().is_ok());

        assert!(ConvDownsampleConfig::new(0, 4).try_validate().is_err());
    }

    #[test]
    fn test_downsample_group_norm_channels() {
        type B = NdArray<f32>;
        let device = Default::default();

        let config = ConvDownsampleConfig::new(4, 6).with_normalization(GroupNormConfig::new(4, 0).into());
        assert!(matches!(
            config.try_validate(),
            Err(ResNetError::InvalidChannels(_))
        ));
        assert!(matches!(
            config.try_init::<B>(&device),
            Err(ResNetError::InvalidChannels(_))
        ));

        let config = ConvDownsampleConfig::new(4, 8).with_normalization(GroupNormConfig::new(4, 0).into());
        let ds: ConvDownsample<B> = config.try_init(&device).unwrap();
        assert_eq!(ds.norm.num_features(), 8);
    }

    #[test]
    fn test_check_shortcut() {
        assert!(needs_projection(64, 256, 1));
        assert!(needs_projection(64, 64, 2));
        assert!(!needs_projection(64, 64, 1));

        assert!(check_shortcut(64, 64, 1, None).is_ok());
        assert!(matches!(
            check_shortcut(64, 128, 2, None),
            Err(ResNetError::InvalidShortcut(_))
        ));

        let ds = ConvDownsampleConfig::new(64, 128).with_stride(2);
        assert!(check_shortcut(64, 128, 2, Some(&ds)).is_ok());
        assert!(matches!(
            check_shortcut(64, 128, 1, Some(&ds)),
            Err(ResNetError::InvalidShortcut(_))
        ));

        let ds = ConvDownsampleConfig::new(64, 64);
        assert!(check_shortcut(64, 64, 1, Some(&ds)).is_ok());
    }

    #[test]
    fn test_downsample_forward() {
        type B = NdArray<f32>;
        let device = Default::default();

        let layer: ConvDownsample<B> = ConvDownsampleConfig::new(4, 8)
            .with_stride(2)
            .try_init(&device)
            .unwrap();
        assert_eq!(layer.in_channels(), 4);
        assert_eq!(layer.out_channels(), 8);
        assert_eq!(layer.stride(), 2);
        assert_eq!(layer.norm.num_features(), 8);

        let input = Tensor::random([2, 4, 7, 7], Distribution::Default, &device);
        let output = layer.forward(input);
        assert_shape_contract!(
            ["batch", "channels", "height", "width"],
            &output,
            &[("batch", 2), ("channels", 8), ("height", 4), ("width", 4)]
        );
    }

    #[test]
    fn test_downsample_names() {
        type B = NdArray<f32>;
        let device = Default::default();

        let layer: ConvDownsample<B> = ConvDownsampleConfig::new(4, 8)
            .try_init(&device)
            .unwrap();

        let shapes = layer.named_shapes();
        assert_eq!(
            shapes.keys().cloned().collect::<Vec<_>>(),
            vec![
                "0.weight",
                "1.bias",
                "1.running_mean",
                "1.running_var",
                "1.weight",
            ]
        );
        assert_eq!(shapes["0.weight"], vec![8, 4, 1, 1]);
    }
}
