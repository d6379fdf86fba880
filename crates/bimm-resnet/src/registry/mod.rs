//! # Pretrained Weight Registry
//!
//! Descriptors for published weights, and the fetch collaborator seam.

pub mod weights;
