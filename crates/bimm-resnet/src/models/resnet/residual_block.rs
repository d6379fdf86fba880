//! # Residual Block Wrapper
//!
//! [`ResidualBlock`] is the tagged union of the two `ResNet` block shapes;
//! [`BlockKind`] names the shape without carrying a config.

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors};
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::errors::ResNetResult;
use crate::models::resnet::basic_block::{
    BASIC_BLOCK_EXPANSION, BasicBlock, BasicBlockConfig, BasicBlockMeta,
};
use crate::models::resnet::bottleneck::{
    BOTTLENECK_EXPANSION, BottleneckBlock, BottleneckBlockConfig, BottleneckBlockMeta,
};
use crate::models::resnet::downsample::ConvDownsampleConfig;
use crate::models::resnet::util::stride_div_output_resolution;
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The residual block shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    /// [`BasicBlock`]; two 3x3 convs, expansion 1.
    Basic,

    /// [`BottleneckBlock`]; 1x1, 3x3, 1x1 convs, expansion 4.
    Bottleneck,
}

impl BlockKind {
    /// The ratio of block output channels to block `planes`.
    pub fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => BASIC_BLOCK_EXPANSION,
            BlockKind::Bottleneck => BOTTLENECK_EXPANSION,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            BlockKind::Basic => write!(f, "BasicBlock"),
            BlockKind::Bottleneck => write!(f, "Bottleneck"),
        }
    }
}

/// Everything a block constructor needs; the stage builder's per-block request.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    /// Block shape.
    pub kind: BlockKind,

    /// Input channels.
    pub in_planes: usize,

    /// Nominal block width.
    pub planes: usize,

    /// Stride.
    pub stride: usize,

    /// Convolution groups.
    pub groups: usize,

    /// Width per group.
    pub base_width: usize,

    /// Dilation.
    pub dilation: usize,

    /// Projection shortcut.
    pub downsample: Option<ConvDownsampleConfig>,

    /// Norm capability.
    pub normalization: NormalizationConfig,
}

/// [`ResidualBlock`] Meta API.
pub trait ResidualBlockMeta {
    /// The block shape.
    fn kind(&self) -> BlockKind;

    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The nominal block width.
    fn planes(&self) -> usize;

    /// The number of output feature planes.
    fn out_planes(&self) -> usize;

    /// The block stride.
    fn stride(&self) -> usize;

    /// The block dilation.
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

/// [`ResidualBlock`] Config.
#[derive(Config, Debug)]
pub enum ResidualBlockConfig {
    /// A `ResNet` [`BasicBlock`].
    Basic(BasicBlockConfig),

    /// A `ResNet` [`BottleneckBlock`].
    Bottleneck(BottleneckBlockConfig),
}

impl From<BasicBlockConfig> for ResidualBlockConfig {
    fn from(config: BasicBlockConfig) -> Self {
        Self::Basic(config)
    }
}

impl From<BottleneckBlockConfig> for ResidualBlockConfig {
    fn from(config: BottleneckBlockConfig) -> Self {
        Self::Bottleneck(config)
    }
}

impl From<BlockRequest> for ResidualBlockConfig {
    fn from(request: BlockRequest) -> Self {
        match request.kind {
            BlockKind::Basic => BasicBlockConfig::new(request.in_planes, request.planes)
                .with_stride(request.stride)
                .with_groups(request.groups)
                .with_base_width(request.base_width)
                .with_dilation(request.dilation)
                .with_downsample(request.downsample)
                .with_normalization(request.normalization)
                .into(),
            BlockKind::Bottleneck => BottleneckBlockConfig::new(request.in_planes, request.planes)
                .with_stride(request.stride)
                .with_groups(request.groups)
                .with_base_width(request.base_width)
                .with_dilation(request.dilation)
                .with_downsample(request.downsample)
                .with_normalization(request.normalization)
                .into(),
        }
    }
}

impl ResidualBlockMeta for ResidualBlockConfig {
    fn kind(&self) -> BlockKind {
        match self {
            Self::Basic(_) => BlockKind::Basic,
            Self::Bottleneck(_) => BlockKind::Bottleneck,
        }
    }

    fn in_planes(&self) -> usize {
        match self {
            Self::Basic(config) => config.in_planes(),
            Self::Bottleneck(config) => config.in_planes(),
        }
    }

    fn planes(&self) -> usize {
        match self {
            Self::Basic(config) => config.planes(),
            Self::Bottleneck(config) => config.planes(),
        }
    }

    fn out_planes(&self) -> usize {
        match self {
            Self::Basic(config) => config.out_planes(),
            Self::Bottleneck(config) => config.out_planes(),
        }
    }

    fn stride(&self) -> usize {
        match self {
            Self::Basic(config) => config.stride(),
            Self::Bottleneck(config) => config.stride(),
        }
    }

    fn dilation(&self) -> usize {
        match self {
            Self::Basic(config) => config.dilation(),
            Self::Bottleneck(config) => config.dilation(),
        }
    }

    fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(config) => config.has_downsample(),
            Self::Bottleneck(config) => config.has_downsample(),
        }
    }
}

impl ResidualBlockConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> ResNetResult<()> {
        match self {
            Self::Basic(config) => config.try_validate(),
            Self::Bottleneck(config) => config.try_validate(),
        }
    }

    /// Initialize a [`ResidualBlock`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<ResidualBlock<B>> {
        Ok(match self {
            Self::Basic(config) => ResidualBlock::Basic(config.try_init(device)?),
            Self::Bottleneck(config) => ResidualBlock::Bottleneck(config.try_init(device)?),
        })
    }
}

/// Residual Block Wrapper.
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    /// A `ResNet` [`BasicBlock`].
    Basic(BasicBlock<B>),

    /// A `ResNet` [`BottleneckBlock`].
    Bottleneck(BottleneckBlock<B>),
}

impl<B: Backend> From<BasicBlock<B>> for ResidualBlock<B> {
    fn from(block: BasicBlock<B>) -> Self {
        Self::Basic(block)
    }
}

impl<B: Backend> From<BottleneckBlock<B>> for ResidualBlock<B> {
    fn from(block: BottleneckBlock<B>) -> Self {
        Self::Bottleneck(block)
    }
}

impl<B: Backend> ResidualBlockMeta for ResidualBlock<B> {
    fn kind(&self) -> BlockKind {
        match self {
            Self::Basic(_) => BlockKind::Basic,
            Self::Bottleneck(_) => BlockKind::Bottleneck,
        }
    }

    fn in_planes(&self) -> usize {
        match self {
            Self::Basic(block) => block.in_planes(),
            Self::Bottleneck(block) => block.in_planes(),
        }
    }

    fn planes(&self) -> usize {
        match self {
            Self::Basic(block) => block.planes(),
            Self::Bottleneck(block) => block.planes(),
        }
    }

    fn out_planes(&self) -> usize {
        match self {
            Self::Basic(block) => block.out_planes(),
            Self::Bottleneck(block) => block.out_planes(),
        }
    }

    fn stride(&self) -> usize {
        match self {
            Self::Basic(block) => block.stride(),
            Self::Bottleneck(block) => block.stride(),
        }
    }

    fn dilation(&self) -> usize {
        match self {
            Self::Basic(block) => block.dilation(),
            Self::Bottleneck(block) => block.dilation(),
        }
    }

    fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(block) => block.has_downsample(),
            Self::Bottleneck(block) => block.has_downsample(),
        }
    }
}

impl<B: Backend> ResidualBlock<B> {
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
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }

    /// The last norm layer of the transform path.
    ///
    /// `bn2` for [`BasicBlock`], `bn3` for [`BottleneckBlock`].
    pub fn final_norm_mut(&mut self) -> &mut Normalization<B> {
        match self {
            Self::Basic(block) => block.final_norm_mut(),
            Self::Bottleneck(block) => block.final_norm_mut(),
        }
    }

    /// Zero the scale of the final norm layer.
    ///
    /// The block then starts as an identity mapping (up to the activation).
    pub fn zero_init_residual(&mut self) {
        self.final_norm_mut().zero_scale();
    }
}

impl<B: Backend> NamedTensors<B> for ResidualBlock<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        match self {
            Self::Basic(block) => block.visit_named(prefix, visitor),
            Self::Bottleneck(block) => block.visit_named(prefix, visitor),
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        match self {
            Self::Basic(block) => Self::Basic(block.map_named(prefix, mapper)),
            Self::Bottleneck(block) => Self::Bottleneck(block.map_named(prefix, mapper)),
        }
    }
}
