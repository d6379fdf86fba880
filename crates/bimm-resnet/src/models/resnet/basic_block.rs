//! # Basic Block for `ResNet`
//!
//! [`BasicBlock`] is the two-convolution `ResNet` residual unit (expansion 1):
//!
//! ```text
//! out = relu(bn2(conv2(relu(bn1(conv1(x))))) + shortcut(x))
//! ```
//!
//! [`BasicBlockMeta`] defines a common meta API for [`BasicBlock`]
//! and [`BasicBlockConfig`].
//!
//! [`BasicBlockConfig`] implements [`Config`], and provides
//! [`BasicBlockConfig::try_init`] to initialize a [`BasicBlock`].
//!
//! [`BasicBlock`] implements [`Module`], and provides
//! [`BasicBlock::forward`].

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors, join_path};
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::errors::{ResNetError, ResNetResult};
use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::layers::conv::conv3x3;
use crate::models::resnet::downsample::{ConvDownsample, ConvDownsampleConfig, check_shortcut};
use crate::models::resnet::util::stride_div_output_resolution;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::prelude::{Backend, Config, Module, Tensor};

/// The [`BasicBlock`] channel expansion.
pub const BASIC_BLOCK_EXPANSION: usize = 1;

/// [`BasicBlock`] Meta trait.
pub trait BasicBlockMeta {
    /// The size of the in channels dimension.
    fn in_planes(&self) -> usize;

    /// The block width.
    fn planes(&self) -> usize;

    /// The size of the out channels dimension.
    ///
    /// ``out_planes = planes * BASIC_BLOCK_EXPANSION``
    fn out_planes(&self) -> usize {
        self.planes() * BASIC_BLOCK_EXPANSION
    }

    /// The stride of the first convolution.
    fn stride(&self) -> usize;

    /// Dilation rate for conv layers.
    fn dilation(&self) -> usize;

    /// Does the block carry a projection shortcut?
    fn has_downsample(&self) -> bool;

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

/// [`BasicBlock`] Config.
///
/// Implements [`BasicBlockMeta`].
#[derive(Config, Debug)]
pub struct BasicBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// The block width.
    pub planes: usize,

    /// The stride of the first convolution.
    #[config(default = 1)]
    pub stride: usize,

    /// Convolution groups; must be 1.
    #[config(default = 1)]
    pub groups: usize,

    /// Base width; must be 64.
    #[config(default = 64)]
    pub base_width: usize,

    /// Dilation; must be 1.
    #[config(default = 1)]
    pub dilation: usize,

    /// Optional projection shortcut.
    #[config(default = "None")]
    pub downsample: Option<ConvDownsampleConfig>,

    /// [`Normalization`] config.
    ///
    /// The feature size of this config will be replaced
    /// with the appropriate feature size for each layer.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,
}

impl BasicBlockMeta for BasicBlockConfig {
    fn in_planes(&self) -> usize {
        self.in_planes
    }

    fn planes(&self) -> usize {
        self.planes
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn dilation(&self) -> usize {
        self.dilation
    }

    fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl BasicBlockConfig {
    fn cna_configs(&self) -> ResNetResult<[CNA2dConfig; 2]> {
        let cna1 = CNA2dConfig::new(conv3x3(
            self.in_planes,
            self.planes,
            self.stride,
            1,
            self.dilation,
        )?)
        .with_norm(self.normalization.clone());

        let cna2 = CNA2dConfig::new(conv3x3(
            self.planes,
            self.out_planes(),
            1,
            1,
            self.dilation,
        )?)
        .with_norm(self.normalization.clone());

        cna1.try_validate()?;
        cna2.try_validate()?;
        Ok([cna1, cna2])
    }

    /// Check if the config is valid.
    ///
    /// Grouping and widening are rejected before dilation.
    pub fn try_validate(&self) -> ResNetResult<()> {
        if self.groups != 1 || self.base_width != 64 {
            return Err(ResNetError::BasicBlockGroups {
                groups: self.groups,
                base_width: self.base_width,
            });
        }
        if self.dilation > 1 {
            return Err(ResNetError::BasicBlockDilation {
                dilation: self.dilation,
            });
        }
        self.cna_configs()?;
        check_shortcut(
            self.in_planes,
            self.out_planes(),
            self.stride,
            self.downsample.as_ref(),
        )
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Initialize a [`BasicBlock`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<BasicBlock<B>> {
        self.try_validate()?;
        let [cna1, cna2] = self.cna_configs()?;

        let downsample = match &self.downsample {
            Some(config) => Some(config.try_init(device)?),
            None => None,
        };

        Ok(BasicBlock {
            downsample,
            cna1: cna1.init(device),
            cna2: cna2.init(device),
        })
    }

    /// Initialize a [`BasicBlock`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> BasicBlock<B> {
        match self.try_init(device) {
            Ok(block) => block,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Basic Block for `ResNet`.
///
/// Implements [`BasicBlockMeta`].
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    /// Optional projection shortcut.
    pub downsample: Option<ConvDownsample<B>>,

    /// First Conv/Norm/Act Block; carries the stride.
    pub cna1: CNA2d<B>,

    /// Second Conv/Norm/Act Block; the shortcut is merged before its activation.
    pub cna2: CNA2d<B>,
}

impl<B: Backend> BasicBlockMeta for BasicBlock<B> {
    fn in_planes(&self) -> usize {
        self.cna1.in_channels()
    }

    fn planes(&self) -> usize {
        self.cna1.out_channels()
    }

    fn out_planes(&self) -> usize {
        self.cna2.out_channels()
    }

    fn stride(&self) -> usize {
        self.cna1.stride()[0]
    }

    fn dilation(&self) -> usize {
        self.cna1.dilation()[0]
    }

    fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl<B: Backend> BasicBlock<B> {
    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, ceil(in_height/stride), ceil(in_width/stride)]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, in_height, in_width] = unpack_shape_contract!(
            ["batch", "in_planes", "in_height", "in_width"],
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_planes", self.in_planes())]
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.cna1.forward(input);
        let x = self.cna2.hook_forward(x, |x| x + identity);

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width),
            ]
        );

        x
    }

    /// The last norm layer of the transform path.
    pub fn final_norm_mut(&mut self) -> &mut Normalization<B> {
        &mut self.cna2.norm
    }
}

impl<B: Backend> NamedTensors<B> for BasicBlock<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        self.cna1.visit_named_pair(
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            visitor,
        );
        self.cna2.visit_named_pair(
            &join_path(prefix, "conv2"),
            &join_path(prefix, "bn2"),
            visitor,
        );
        if let Some(downsample) = &self.downsample {
            downsample.visit_named(&join_path(prefix, "downsample"), visitor);
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.cna1 = self.cna1.map_named_pair(
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            mapper,
        );
        self.cna2 = self.cna2.map_named_pair(
            &join_path(prefix, "conv2"),
            &join_path(prefix, "bn2"),
            mapper,
        );
        self.downsample = self
            .downsample
            .map(|downsample| downsample.map_named(&join_path(prefix, "downsample"), mapper));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    #[test]
    fn test_basic_block_config() {
        let config = BasicBlockConfig::new(16, 16);
        assert_eq!(config.in_planes(), 16);
        assert_eq!(config.out_planes(), 16);
        assert_eq!(config.stride(), 1);
        assert_eq!(config.dilation(), 1);
        assert!(!config.has_downsample());
        assert_eq!(config.output_resolution([16, 16]), [16, 16]);
        assert!(config.try_validate().is_ok());

        let config = BasicBlockConfig::new(16, 32)
            .with_stride(2)
            .with_downsample(Some(ConvDownsampleConfig::new(16, 32).with_stride(2)));
        assert!(config.has_downsample());
        assert_eq!(config.output_resolution([15, 16]), [8, 8]);
        assert!(config.try_validate().is_ok());
    }

    #[test]
    fn test_basic_block_rejects_groups_and_width() {
        let err = BasicBlockConfig::new(16, 16)
            .with_groups(2)
            .try_validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ResNetError::BasicBlockGroups {
                groups: 2,
                base_width: 64
            }
        ));

        let err = BasicBlockConfig::new(16, 16)
            .with_base_width(128)
            .try_validate()
            .unwrap_err();
        assert!(matches!(err, ResNetError::BasicBlockGroups { .. }));
    }

    #[test]
    fn test_basic_block_rejects_dilation() {
        let err = BasicBlockConfig::new(16, 16)
            .with_dilation(2)
            .try_validate()
            .unwrap_err();
        assert!(matches!(err, ResNetError::BasicBlockDilation { dilation: 2 }));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_basic_block_rejects_missing_shortcut() {
        let err = BasicBlockConfig::new(16, 32).try_validate().unwrap_err();
        assert!(matches!(err, ResNetError::InvalidShortcut(_)));

        let err = BasicBlockConfig::new(16, 16)
            .with_stride(2)
            .try_validate()
            .unwrap_err();
        assert!(matches!(err, ResNetError::InvalidShortcut(_)));
    }

    #[test]
    #[should_panic(expected = "BasicBlock only supports groups=1")]
    fn test_basic_block_init_panics() {
        type B = NdArray<f32>;
        let device = Default::default();
        let _block: BasicBlock<B> = BasicBlockConfig::new(16, 16).with_groups(2).init(&device);
    }

    #[test]
    fn test_basic_block_meta() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(4, 8)
            .with_stride(2)
            .with_downsample(Some(ConvDownsampleConfig::new(4, 8).with_stride(2)))
            .init(&device);

        assert_eq!(block.in_planes(), 4);
        assert_eq!(block.planes(), 8);
        assert_eq!(block.out_planes(), 8);
        assert_eq!(block.stride(), 2);
        assert_eq!(block.dilation(), 1);
        assert!(block.has_downsample());
        assert_eq!(block.output_resolution([16, 16]), [8, 8]);
    }

    #[test]
    fn test_basic_block_forward_identity_shortcut_autodiff() {
        type B = Autodiff<NdArray<f32>>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(4, 4).init(&device);

        let input = Tensor::random([2, 4, 8, 8], Distribution::Default, &device);
        let output = block.forward(input);

        assert_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &output,
            &[
                ("batch", 2),
                ("out_channels", 4),
                ("out_height", 8),
                ("out_width", 8)
            ],
        );
    }

    #[test]
    fn test_basic_block_forward_projection_odd_resolution() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(2, 4)
            .with_stride(2)
            .with_downsample(Some(ConvDownsampleConfig::new(2, 4).with_stride(2)))
            .init(&device);

        let input = Tensor::random([2, 2, 7, 9], Distribution::Default, &device);
        let output = block.forward(input);

        assert_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &output,
            &[
                ("batch", 2),
                ("out_channels", 4),
                ("out_height", 4),
                ("out_width", 5)
            ],
        );
    }

    #[test]
    fn test_zeroed_final_norm_is_identity() {
        type B = NdArray<f32>;
        let device = Default::default();

        let mut block: BasicBlock<B> = BasicBlockConfig::new(3, 3).init(&device);
        block.final_norm_mut().zero_scale();

        // Uniform [0, 1) input is its own relu.
        let input: Tensor<B, 4> = Tensor::random([2, 3, 5, 5], Distribution::Default, &device);
        let output = block.forward(input.clone());

        output.to_data().assert_eq(&input.to_data(), true);
    }

    #[test]
    fn test_basic_block_names() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(2, 4)
            .with_downsample(Some(ConvDownsampleConfig::new(2, 4)))
            .init(&device);

        let shapes = block.named_shapes();
        assert_eq!(shapes.len(), 2 + 2 * 4 + 1 + 4);
        assert_eq!(shapes["conv1.weight"], vec![4, 2, 3, 3]);
        assert_eq!(shapes["bn2.running_var"], vec![4]);
        assert_eq!(shapes["downsample.0.weight"], vec![4, 2, 1, 1]);
        assert_eq!(shapes["downsample.1.weight"], vec![4]);
    }
}
