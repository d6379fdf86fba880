#![warn(missing_docs)]
//!# bimm-resnet - `ResNet` Family Topologies for Burn
//!
//! Builds shape-consistent `ResNet`, `ResNeXt` and `Wide-ResNet` layer graphs
//! from a small set of hyperparameters, and optionally hydrates them with
//! pretrained weights keyed by their ``torchvision`` parameter paths.
//!
//! ## Notable Components
//!
//! * [`errors`] - the configuration-time [`errors::ResNetError`].
//! * [`compat`] - compat code around ``burn`` layers.
//!   * [`compat::normalization_wrapper::Normalization`] - pluggable norm layer wrapper.
//!   * [`compat::named_tensors`] - dotted-path tensor export/import.
//! * [`layers`] - reusable neural network modules.
//!   * [`layers::conv`] - `conv3x3` / `conv1x1` layer factories.
//!   * [`layers::blocks::cna`] - ``Conv2d + Norm + Relu`` block.
//! * [`registry`] - pretrained weight descriptors and the fetch collaborator.
//! * [`models`] - complete model families.
//!   * [`models::resnet`] - `ResNet` / `ResNeXt` / `Wide-ResNet`.

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

pub mod compat;
pub mod errors;
pub mod layers;
pub mod models;
pub mod registry;
