//! # `ResNet` Core Model
//!
//! [`ResNetConfig`] implements [`Config`], and provides the high-level
//! hyperparameter interface (block kind, stage depths, groups, width, dilation policy).
//! [`ResNetConfig::to_structure`] runs the stage builder and yields a
//! [`ResNetStructureConfig`]: the fully expanded layer graph.
//!
//! [`ResNetStructureConfig::init`] allocates a [`ResNet`] module,
//! and applies the initialization rules:
//! * convs: Kaiming normal, fan-out, for ``ReLU``;
//! * norms: scale 1, bias 0;
//! * optionally, the final norm scale of every block is then zeroed.

use crate::compat::conv_shape::expect_max_pool2d_config_output_shape;
use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors};
use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{ResNetError, ResNetResult};
use crate::layers::blocks::cna::{CNA2d, CNA2dConfig, CNA2dMeta};
use crate::layers::conv::CONV_INTO_RELU_INITIALIZER;
use crate::models::resnet::layer_block::{LayerBlock, LayerBlockConfig, LayerBlockMeta};
use crate::models::resnet::residual_block::BlockKind;
use crate::models::resnet::stage_builder::StageBuilder;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Stem output channels; the stage builder starts here.
pub const STEM_PLANES: usize = 64;

/// Per-stage nominal widths.
pub const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// Per-stage nominal strides; the first stage never downsamples.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// `ResNet-18` stage depths.
pub const RESNET18_LAYERS: [usize; 4] = [2, 2, 2, 2];

/// `ResNet-34` / `ResNet-50` stage depths.
pub const RESNET34_LAYERS: [usize; 4] = [3, 4, 6, 3];

/// `ResNet-101` stage depths.
pub const RESNET101_LAYERS: [usize; 4] = [3, 4, 23, 3];

/// `ResNet-152` stage depths.
pub const RESNET152_LAYERS: [usize; 4] = [3, 8, 36, 3];

/// High-level [`ResNet`] Config.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Residual block shape.
    pub block: BlockKind,

    /// Blocks per stage.
    pub layers: [usize; 4],

    /// Classifier outputs.
    #[config(default = 1000)]
    pub num_classes: usize,

    /// Convolution groups of the bottleneck 3x3 convs.
    #[config(default = 1)]
    pub groups: usize,

    /// Width per group.
    #[config(default = 64)]
    pub width_per_group: usize,

    /// Per-stage (2, 3, 4) substitution of dilation for stride.
    ///
    /// ``None`` means ``[false, false, false]``; when present it must have 3 elements.
    #[config(default = "None")]
    pub replace_stride_with_dilation: Option<Vec<bool>>,

    /// Zero the final norm scale of every block after init.
    #[config(default = false)]
    pub zero_init_residual: bool,

    /// Normalization capability; resized per layer.
    #[config(default = "NormalizationConfig::default()")]
    pub normalization: NormalizationConfig,

    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl ResNetConfig {
    /// `ResNet-18`.
    pub fn resnet18() -> Self {
        Self::new(BlockKind::Basic, RESNET18_LAYERS)
    }

    /// `ResNet-34`.
    pub fn resnet34() -> Self {
        Self::new(BlockKind::Basic, RESNET34_LAYERS)
    }

    /// `ResNet-50`.
    pub fn resnet50() -> Self {
        Self::new(BlockKind::Bottleneck, RESNET34_LAYERS)
    }

    /// `ResNet-101`.
    pub fn resnet101() -> Self {
        Self::new(BlockKind::Bottleneck, RESNET101_LAYERS)
    }

    /// `ResNet-152`.
    pub fn resnet152() -> Self {
        Self::new(BlockKind::Bottleneck, RESNET152_LAYERS)
    }

    /// `ResNeXt-50 32x4d`.
    pub fn resnext50_32x4d() -> Self {
        Self::resnet50().with_groups(32).with_width_per_group(4)
    }

    /// `ResNeXt-101 32x8d`.
    pub fn resnext101_32x8d() -> Self {
        Self::resnet101().with_groups(32).with_width_per_group(8)
    }

    /// `Wide ResNet-50-2`; the bottleneck is twice as wide.
    pub fn wide_resnet50_2() -> Self {
        Self::resnet50().with_width_per_group(64 * 2)
    }

    /// `Wide ResNet-101-2`; the bottleneck is twice as wide.
    pub fn wide_resnet101_2() -> Self {
        Self::resnet101().with_width_per_group(64 * 2)
    }

    /// Resolve the dilation policy.
    ///
    /// # Returns
    ///
    /// ``[false; 3]`` when absent; the policy when it has 3 elements;
    /// else [`ResNetError::InvalidDilationPolicy`].
    pub fn dilation_policy(&self) -> ResNetResult<[bool; 3]> {
        match self.replace_stride_with_dilation.as_deref() {
            None => Ok([false; 3]),
            Some(&[a, b, c]) => Ok([a, b, c]),
            Some(policy) => Err(ResNetError::InvalidDilationPolicy { len: policy.len() }),
        }
    }

    /// The stem config: ``conv7x7(in_channels -> 64, stride 2) -> norm -> relu``.
    pub fn stem_config(&self) -> ResNetResult<CNA2dConfig> {
        if self.in_channels == 0 {
            return Err(ResNetError::InvalidChannels(
                "in_channels must be positive".to_string(),
            ));
        }
        Ok(CNA2dConfig::new(
            Conv2dConfig::new([self.in_channels, STEM_PLANES], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .with_initializer(CONV_INTO_RELU_INITIALIZER),
        )
        .with_norm(self.normalization.clone()))
    }

    /// Expand to a [`ResNetStructureConfig`].
    ///
    /// The dilation policy is checked before any stage is built.
    pub fn to_structure(&self) -> ResNetResult<ResNetStructureConfig> {
        let policy = self.dilation_policy()?;
        let stem = self.stem_config()?;

        let mut builder = StageBuilder::new(
            self.block,
            self.groups,
            self.width_per_group,
            self.normalization.clone(),
            STEM_PLANES,
        );

        let mut layers = Vec::with_capacity(4);
        for idx in 0..4 {
            let dilate = idx > 0 && policy[idx - 1];
            layers.push(builder.build_stage(
                STAGE_PLANES[idx],
                self.layers[idx],
                STAGE_STRIDES[idx],
                dilate,
            )?);
        }

        let config = ResNetStructureConfig {
            stem,
            stem_pool: default_stem_pool(),
            layers,
            num_classes: self.num_classes,
            zero_init_residual: self.zero_init_residual,
        };
        config.try_validate()?;
        Ok(config)
    }

    /// Build the structure, then initialize a [`ResNet`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<ResNet<B>> {
        self.to_structure()?.try_init(device)
    }
}

/// The stem max pool: ``3x3, stride 2, padding 1``.
pub fn default_stem_pool() -> MaxPool2dConfig {
    MaxPool2dConfig::new([3, 3])
        .with_strides([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
}

/// Fully expanded [`ResNet`] Config.
#[derive(Config, Debug)]
pub struct ResNetStructureConfig {
    /// The stem conv/norm/act.
    pub stem: CNA2dConfig,

    /// The stem max pool.
    #[config(default = "default_stem_pool()")]
    pub stem_pool: MaxPool2dConfig,

    /// The four stages.
    pub layers: Vec<LayerBlockConfig>,

    /// Classifier outputs.
    #[config(default = 1000)]
    pub num_classes: usize,

    /// Zero the final norm scale of every block after init.
    #[config(default = false)]
    pub zero_init_residual: bool,
}

impl ResNetStructureConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> ResNetResult<()> {
        if self.layers.len() != 4 {
            return Err(ResNetError::InvalidStage(format!(
                "expected 4 stages, got {}",
                self.layers.len()
            )));
        }
        if self.num_classes == 0 {
            return Err(ResNetError::InvalidChannels(
                "num_classes must be positive".to_string(),
            ));
        }
        self.stem.try_validate()?;
        let mut planes = self.stem.out_channels();
        for (idx, layer) in self.layers.iter().enumerate() {
            layer.try_validate()?;
            if layer.in_planes() != planes {
                return Err(ResNetError::InvalidStage(format!(
                    "layer{}.in_planes({}) != {planes}",
                    idx + 1,
                    layer.in_planes(),
                )));
            }
            planes = layer.out_planes();
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Input image channels.
    pub fn in_channels(&self) -> usize {
        self.stem.in_channels()
    }

    /// Channels entering the classifier.
    pub fn feature_planes(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.out_planes())
    }

    /// The shapes at every stage boundary; no weights are allocated.
    ///
    /// # Returns
    ///
    /// ``[batch, out_planes, height, width]`` for each of the 4 stages.
    pub fn stage_output_shapes(
        &self,
        batch: usize,
        input_resolution: [usize; 2],
    ) -> Vec<[usize; 4]> {
        let resolution = self.stem.output_resolution(input_resolution);
        let mut resolution = expect_max_pool2d_config_output_shape(&self.stem_pool, resolution);
        self.layers
            .iter()
            .map(|layer| {
                resolution = layer.output_resolution(resolution);
                [batch, layer.out_planes(), resolution[0], resolution[1]]
            })
            .collect()
    }

    /// The logits shape.
    ///
    /// The last stage output, ``[batch, feature_planes, height, width]``, is
    /// pooled to ``[batch, feature_planes]`` and then classified to
    /// ``[batch, num_classes]``; any non-empty resolution yields the same shape.
    ///
    /// # Panics
    ///
    /// If the input resolution is empty, as `forward` would.
    pub fn output_shape(
        &self,
        batch: usize,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let stages = self.stage_output_shapes(batch, input_resolution);
        let [batch, _planes, _height, _width] = stages
            .last()
            .copied()
            .unwrap_or([batch, self.feature_planes(), 1, 1]);
        [batch, self.num_classes]
    }

    /// Initialize a [`ResNet`] model.
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<ResNet<B>> {
        self.try_validate()?;

        let mut layers = self
            .layers
            .iter()
            .map(|layer| layer.try_init(device))
            .collect::<ResNetResult<Vec<_>>>()?;

        if self.zero_init_residual {
            for layer in layers.iter_mut() {
                layer.zero_init_residual();
            }
        }

        Ok(ResNet {
            stem: self.stem.clone().init(device),
            stem_pool: self.stem_pool.init(),
            layers,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(self.feature_planes(), self.num_classes).init(device),
        })
    }

    /// Initialize a [`ResNet`] model.
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNet<B> {
        match self.try_init(device) {
            Ok(model) => model,
            Err(err) => panic!("{err}"),
        }
    }
}

/// `ResNet` model.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    /// Stem conv/norm/act.
    pub stem: CNA2d<B>,

    /// Stem max pool.
    pub stem_pool: MaxPool2d,

    /// The four stages.
    pub layers: Vec<LayerBlock<B>>,

    /// Global pool.
    pub avgpool: AdaptiveAvgPool2d,

    /// Classifier.
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    /// Input image channels.
    pub fn in_channels(&self) -> usize {
        self.stem.in_channels()
    }

    /// Channels entering the classifier.
    pub fn feature_planes(&self) -> usize {
        self.fc.weight.dims()[0]
    }

    /// Classifier outputs.
    pub fn num_classes(&self) -> usize {
        self.fc.weight.dims()[1]
    }

    fn forward_stem(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = self.stem.forward(input);
        self.stem_pool.forward(x)
    }

    /// Stage feature maps.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    ///
    /// # Returns
    ///
    /// The output of each stage, in order.
    pub fn forward_features(
        &self,
        input: Tensor<B, 4>,
    ) -> Vec<Tensor<B, 4>> {
        let mut x = self.forward_stem(input);
        let mut features = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            x = layer.forward(x);
            features.push(x.clone());
        }
        features
    }

    /// `ResNet` forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``;
    ///   height and width divisible by 32 are recommended, not required.
    ///
    /// # Returns
    ///
    /// ``[batch, num_classes]`` logits.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        let [batch] = unpack_shape_contract!(
            ["batch", "in_channels", "height", "width"],
            &input,
            &["batch"],
            &[("in_channels", self.in_channels())]
        );

        let x = self.forward_stem(input);
        let x = self.layers.iter().fold(x, |x, layer| layer.forward(x));

        // [batch, C, H, W] -> [batch, C, 1, 1] -> [batch, C]
        let x = self.avgpool.forward(x);
        let x = x.flatten(1, 3);
        let x = self.fc.forward(x);

        assert_shape_contract_periodically!(
            ["batch", "num_classes"],
            &x,
            &[("batch", batch), ("num_classes", self.num_classes())]
        );

        x
    }

    /// Re-initialize the classifier with the specified number of output classes.
    pub fn with_classes(
        mut self,
        num_classes: usize,
    ) -> Self {
        let [d_input, _d_output] = self.fc.weight.dims();
        self.fc = LinearConfig::new(d_input, num_classes).init(&self.fc.weight.device());
        self
    }
}

/// ``torchvision`` parameter paths:
/// ``conv1``, ``bn1``, ``layer{1..4}.{idx}.*``, ``fc``.
impl<B: Backend> NamedTensors<B> for ResNet<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        use crate::compat::named_tensors::join_path;
        self.stem.visit_named_pair(
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            visitor,
        );
        for (idx, layer) in self.layers.iter().enumerate() {
            layer.visit_named(&join_path(prefix, &format!("layer{}", idx + 1)), visitor);
        }
        self.fc.visit_named(&join_path(prefix, "fc"), visitor);
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        use crate::compat::named_tensors::join_path;
        self.stem = self.stem.map_named_pair(
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            mapper,
        );
        self.layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(idx, layer)| {
                layer.map_named(&join_path(prefix, &format!("layer{}", idx + 1)), mapper)
            })
            .collect();
        self.fc = self.fc.map_named(&join_path(prefix, "fc"), mapper);
        self
    }
}
