//! # `ResNet`
//!
//! `ResNet`, `ResNeXt` and `Wide-ResNet` topologies.
//!
//! * [`resnet_model::ResNetConfig`] - the hyperparameter config.
//! * [`stage_builder::StageBuilder`] - expands stages into residual blocks.
//! * [`resnet_model::ResNetStructureConfig`] - the expanded layer graph.
//! * [`prefabs`] - the named presets and their pretrained weights.

pub mod basic_block;
pub mod bottleneck;
pub mod downsample;
pub mod layer_block;
pub mod prefabs;
pub mod residual_block;
pub mod resnet_model;
pub mod stage_builder;
pub mod util;
