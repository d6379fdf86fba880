//! # `ResNet` Stage Builder
//!
//! [`StageBuilder`] is the build-local cursor threaded through stage
//! construction. It tracks the channel count and dilation reached so far,
//! and emits one [`LayerBlockConfig`] per [`StageBuilder::build_stage`] call.
//!
//! Every build owns its own cursor; nothing is shared between builds.

use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{ResNetError, ResNetResult};
use crate::models::resnet::downsample::{ConvDownsampleConfig, needs_projection};
use crate::models::resnet::layer_block::LayerBlockConfig;
use crate::models::resnet::residual_block::{BlockKind, BlockRequest, ResidualBlockConfig};

/// Stage construction cursor.
#[derive(Debug, Clone)]
pub struct StageBuilder {
    block: BlockKind,
    groups: usize,
    base_width: usize,
    normalization: NormalizationConfig,

    in_planes: usize,
    dilation: usize,
}

impl StageBuilder {
    /// Create a cursor at ``(in_planes, dilation=1)``.
    pub fn new(
        block: BlockKind,
        groups: usize,
        base_width: usize,
        normalization: NormalizationConfig,
        in_planes: usize,
    ) -> Self {
        Self {
            block,
            groups,
            base_width,
            normalization,
            in_planes,
            dilation: 1,
        }
    }

    /// The block shape.
    pub fn block(&self) -> BlockKind {
        self.block
    }

    /// The channel count the next stage will receive.
    pub fn in_planes(&self) -> usize {
        self.in_planes
    }

    /// The dilation reached so far.
    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Build one stage, and advance the cursor.
    ///
    /// 1. With `dilate`, the stride is traded for dilation:
    ///    ``dilation *= stride; stride = 1``.
    /// 2. The first block receives the stride, the pre-stage dilation,
    ///    and a projection shortcut iff ``stride != 1 || in_planes != planes * expansion``.
    /// 3. The remaining blocks are shape-preserving, at the updated dilation.
    ///
    /// # Returns
    ///
    /// The stage config; or an error for an empty stage or an invalid block.
    pub fn build_stage(
        &mut self,
        planes: usize,
        block_count: usize,
        stride: usize,
        dilate: bool,
    ) -> ResNetResult<LayerBlockConfig> {
        if block_count == 0 {
            return Err(ResNetError::InvalidStage(format!(
                "stage with planes={planes} has block_count=0"
            )));
        }

        let previous_dilation = self.dilation;
        let mut stride = stride;
        if dilate {
            self.dilation *= stride;
            stride = 1;
        }

        let out_planes = planes * self.block.expansion();
        let downsample = if needs_projection(self.in_planes, out_planes, stride) {
            Some(
                ConvDownsampleConfig::new(self.in_planes, out_planes)
                    .with_stride(stride)
                    .with_normalization(self.normalization.clone()),
            )
        } else {
            None
        };
        let has_downsample = downsample.is_some();

        let mut blocks: Vec<ResidualBlockConfig> = Vec::with_capacity(block_count);
        blocks.push(
            BlockRequest {
                kind: self.block,
                in_planes: self.in_planes,
                planes,
                stride,
                groups: self.groups,
                base_width: self.base_width,
                dilation: previous_dilation,
                downsample,
                normalization: self.normalization.clone(),
            }
            .into(),
        );
        self.in_planes = out_planes;

        for _ in 1..block_count {
            blocks.push(
                BlockRequest {
                    kind: self.block,
                    in_planes: self.in_planes,
                    planes,
                    stride: 1,
                    groups: self.groups,
                    base_width: self.base_width,
                    dilation: self.dilation,
                    downsample: None,
                    normalization: self.normalization.clone(),
                }
                .into(),
            );
        }

        let stage: LayerBlockConfig = blocks.into();
        stage.try_validate()?;

        tracing::debug!(
            block = %self.block,
            planes,
            block_count,
            stride,
            dilation = self.dilation,
            has_downsample,
            "built stage"
        );

        Ok(stage)
    }
}
