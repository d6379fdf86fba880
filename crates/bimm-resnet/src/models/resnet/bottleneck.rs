//! # Bottleneck Block for `ResNet`
//!
//! [`BottleneckBlock`] is the three-convolution `ResNet` residual unit (expansion 4):
//!
//! ```text
//! width = planes * base_width / 64 * groups
//! out = relu(bn3(conv3(relu(bn2(conv2(relu(bn1(conv1(x)))))))) + shortcut(x))
//! ```
//!
//! The stride, grouping and dilation are all carried by the middle 3x3 conv.
//!
//! [`BottleneckBlockMeta`] defines a common meta API for [`BottleneckBlock`]
//! and [`BottleneckBlockConfig`].

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors, join_path};
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::errors::{ResNetError, ResNetResult};
use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::layers::conv::{conv1x1, conv3x3};
use crate::models::resnet::downsample::{ConvDownsample, ConvDownsampleConfig, check_shortcut};
use crate::models::resnet::util::stride_div_output_resolution;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::prelude::{Backend, Config, Module, Tensor};

/// The [`BottleneckBlock`] channel expansion.
pub const BOTTLENECK_EXPANSION: usize = 4;

/// Bottleneck inner width.
///
/// ``floor(planes * base_width / 64) * groups``
pub fn bottleneck_width(
    planes: usize,
    base_width: usize,
    groups: usize,
) -> usize {
    (planes * base_width / 64) * groups
}

/// [`BottleneckBlock`] Meta trait.
pub trait BottleneckBlockMeta {
    /// The size of the in channels dimension.
    fn in_planes(&self) -> usize;

    /// The nominal block width.
    fn planes(&self) -> usize;

    /// Inner width of the 3x3 conv.
    fn width(&self) -> usize;

    /// Convolution groups of the 3x3 conv.
    fn groups(&self) -> usize;

    /// The size of the out channels dimension.
    ///
    /// ``out_planes = planes * BOTTLENECK_EXPANSION``
    fn out_planes(&self) -> usize {
        self.planes() * BOTTLENECK_EXPANSION
    }

    /// The stride of the 3x3 conv.
    fn stride(&self) -> usize;

    /// Dilation of the 3x3 conv.
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

/// [`BottleneckBlock`] Config.
///
/// Implements [`BottleneckBlockMeta`].
#[derive(Config, Debug)]
pub struct BottleneckBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// The nominal block width.
    pub planes: usize,

    /// The stride of the 3x3 conv.
    #[config(default = 1)]
    pub stride: usize,

    /// Groups of the 3x3 conv.
    #[config(default = 1)]
    pub groups: usize,

    /// Width per group.
    #[config(default = 64)]
    pub base_width: usize,

    /// Dilation of the 3x3 conv.
    #[config(default = 1)]
    pub dilation: usize,

    /// Optional projection shortcut.
    #[config(default = "None")]
    pub downsample: Option<ConvDownsampleConfig>,

    /// [`Normalization`] config.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,
}

impl BottleneckBlockMeta for BottleneckBlockConfig {
    fn in_planes(&self) -> usize {
        self.in_planes
    }

    fn planes(&self) -> usize {
        self.planes
    }

    fn width(&self) -> usize {
        bottleneck_width(self.planes, self.base_width, self.groups)
    }

    fn groups(&self) -> usize {
        self.groups
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

impl BottleneckBlockConfig {
    fn cna_configs(&self) -> ResNetResult<[CNA2dConfig; 3]> {
        let width = self.width();
        if width == 0 {
            return Err(ResNetError::InvalidChannels(format!(
                "bottleneck width is zero for planes={}, base_width={}, groups={}",
                self.planes, self.base_width, self.groups
            )));
        }
        let norm = &self.normalization;

        let configs = [
            CNA2dConfig::new(conv1x1(self.in_planes, width, 1)?).with_norm(norm.clone()),
            CNA2dConfig::new(conv3x3(
                width,
                width,
                self.stride,
                self.groups,
                self.dilation,
            )?)
            .with_norm(norm.clone()),
            CNA2dConfig::new(conv1x1(width, self.out_planes(), 1)?).with_norm(norm.clone()),
        ];
        for config in &configs {
            config.try_validate()?;
        }
        Ok(configs)
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> ResNetResult<()> {
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

    /// Initialize a [`BottleneckBlock`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<BottleneckBlock<B>> {
        self.try_validate()?;
        let [cna1, cna2, cna3] = self.cna_configs()?;

        let downsample = match &self.downsample {
            Some(config) => Some(config.try_init(device)?),
            None => None,
        };

        Ok(BottleneckBlock {
            downsample,
            cna1: cna1.init(device),
            cna2: cna2.init(device),
            cna3: cna3.init(device),
        })
    }

    /// Initialize a [`BottleneckBlock`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> BottleneckBlock<B> {
        match self.try_init(device) {
            Ok(block) => block,
            Err(err) => panic!("{err}"),
        }
    }
}

/// Bottleneck Block for `ResNet`.
///
/// Implements [`BottleneckBlockMeta`].
#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
    /// Optional projection shortcut.
    pub downsample: Option<ConvDownsample<B>>,

    /// 1x1 reduction to `width`.
    pub cna1: CNA2d<B>,

    /// 3x3 grouped/strided/dilated conv.
    pub cna2: CNA2d<B>,

    /// 1x1 expansion to `out_planes`; the shortcut is merged before its activation.
    pub cna3: CNA2d<B>,
}

impl<B: Backend> BottleneckBlockMeta for BottleneckBlock<B> {
    fn in_planes(&self) -> usize {
        self.cna1.in_channels()
    }

    fn planes(&self) -> usize {
        self.cna3.out_channels() / BOTTLENECK_EXPANSION
    }

    fn width(&self) -> usize {
        self.cna2.out_channels()
    }

    fn groups(&self) -> usize {
        self.cna2.groups()
    }

    fn out_planes(&self) -> usize {
        self.cna3.out_channels()
    }

    fn stride(&self) -> usize {
        self.cna2.stride()[0]
    }

    fn dilation(&self) -> usize {
        self.cna2.dilation()[0]
    }

    fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl<B: Backend> BottleneckBlock<B> {
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
        let x = self.cna2.forward(x);

        assert_shape_contract_periodically!(
            ["batch", "width", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("width", self.width()),
                ("out_height", out_height),
                ("out_width", out_width),
            ]
        );

        let x = self.cna3.hook_forward(x, |x| x + identity);

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
        &mut self.cna3.norm
    }
}

impl<B: Backend> NamedTensors<B> for BottleneckBlock<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        for (idx, cna) in [&self.cna1, &self.cna2, &self.cna3].into_iter().enumerate() {
            cna.visit_named_pair(
                &join_path(prefix, &format!("conv{}", idx + 1)),
                &join_path(prefix, &format!("bn{}", idx + 1)),
                visitor,
            );
        }
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
        self.cna3 = self.cna3.map_named_pair(
            &join_path(prefix, "conv3"),
            &join_path(prefix, "bn3"),
            mapper,
        );
        self.downsample = self
            .downsample
            .map(|downsample| downsample.map_named(&join_path(prefix, "downsample"), mapper));
        self
    }
}
