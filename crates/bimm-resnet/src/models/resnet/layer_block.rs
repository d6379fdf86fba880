//! # `ResNet` Layer Block
//!
//! A [`LayerBlock`] is one `ResNet` stage: a sequence of [`ResidualBlock`]s.
//!
//! [`LayerBlockMeta`] defines a common meta API for [`LayerBlock`]
//! and [`LayerBlockConfig`].

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors, join_path};
use crate::errors::{ResNetError, ResNetResult};
use crate::models::resnet::residual_block::{
    ResidualBlock, ResidualBlockConfig, ResidualBlockMeta,
};
use crate::models::resnet::util::stride_div_output_resolution;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};

/// [`LayerBlock`] Meta API.
pub trait LayerBlockMeta {
    /// The number of blocks.
    fn len(&self) -> usize;

    /// Check if the layer block is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The number of output feature planes.
    fn out_planes(&self) -> usize;

    /// Get the effective stride of the layers.
    fn stride(&self) -> usize;

    /// The dilation of the trailing blocks.
    fn dilation(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    ///
    /// ``ceil(ceil(x / a) / b) == ceil(x / (a * b))``, so the product stride suffices.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`LayerBlock`] Configuration.
#[derive(Config, Debug)]
pub struct LayerBlockConfig {
    /// The component blocks.
    pub blocks: Vec<ResidualBlockConfig>,
}

impl From<Vec<ResidualBlockConfig>> for LayerBlockConfig {
    fn from(blocks: Vec<ResidualBlockConfig>) -> Self {
        Self { blocks }
    }
}

impl LayerBlockMeta for LayerBlockConfig {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_planes(&self) -> usize {
        self.blocks.first().map_or(0, |block| block.in_planes())
    }

    fn out_planes(&self) -> usize {
        self.blocks.last().map_or(0, |block| block.out_planes())
    }

    fn stride(&self) -> usize {
        self.blocks
            .iter()
            .fold(1, |acc, block| acc * block.stride())
    }

    fn dilation(&self) -> usize {
        self.blocks.last().map_or(1, |block| block.dilation())
    }
}

impl LayerBlockConfig {
    /// Check if the config is valid.
    ///
    /// The stage must be non-empty, chain `out_planes -> in_planes`,
    /// and every block must be valid.
    pub fn try_validate(&self) -> ResNetResult<()> {
        if self.is_empty() {
            return Err(ResNetError::InvalidStage("blocks is empty".to_string()));
        }

        for (idx, block) in self.blocks.iter().enumerate() {
            block.try_validate()?;
            if idx > 0 {
                let prev = &self.blocks[idx - 1];
                if prev.out_planes() != block.in_planes() {
                    return Err(ResNetError::InvalidStage(format!(
                        "block[{}].out_planes({}) != block[{}].in_planes({})",
                        idx - 1,
                        prev.out_planes(),
                        idx,
                        block.in_planes(),
                    )));
                }
            }
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Initialize a new [`LayerBlock`].
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResNetResult<LayerBlock<B>> {
        self.try_validate()?;
        Ok(LayerBlock {
            blocks: self
                .blocks
                .iter()
                .map(|block| block.try_init(device))
                .collect::<ResNetResult<Vec<_>>>()?,
        })
    }
}

/// Layer block.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    /// Internal blocks.
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlockMeta for LayerBlock<B> {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_planes(&self) -> usize {
        self.blocks.first().map_or(0, |block| block.in_planes())
    }

    fn out_planes(&self) -> usize {
        self.blocks.last().map_or(0, |block| block.out_planes())
    }

    fn stride(&self) -> usize {
        self.blocks
            .iter()
            .fold(1, |acc, block| acc * block.stride())
    }

    fn dilation(&self) -> usize {
        self.blocks.last().map_or(1, |block| block.dilation())
    }
}

impl<B: Backend> LayerBlock<B> {
    /// Apply the layer block.
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
            &[("in_planes", self.in_planes())],
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let x = self.blocks.iter().fold(input, |x, block| block.forward(x));

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width)
            ],
        );

        x
    }

    /// Zero the final norm scale of every block.
    pub fn zero_init_residual(&mut self) {
        for block in self.blocks.iter_mut() {
            block.zero_init_residual();
        }
    }
}

/// Blocks are named by index: ``{prefix}.{idx}``.
impl<B: Backend> NamedTensors<B> for LayerBlock<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        for (idx, block) in self.blocks.iter().enumerate() {
            block.visit_named(&join_path(prefix, &idx.to_string()), visitor);
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(idx, block)| block.map_named(&join_path(prefix, &idx.to_string()), mapper))
            .collect();
        self
    }
}
