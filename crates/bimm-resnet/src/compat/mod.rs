//! # Compat code around ``burn`` layers.

pub mod conv_shape;
pub mod named_tensors;
pub mod normalization_wrapper;
