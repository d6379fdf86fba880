//! # Configuration Errors
//!
//! Every failure in this crate is a configuration-time failure;
//! no error depends on the contents of an input tensor.

use thiserror::Error;

/// Errors raised while describing, building, or hydrating a `ResNet` graph.
#[derive(Debug, Error)]
pub enum ResNetError {
    /// A layer factory was given unusable channel / group / stride values.
    #[error("invalid channels: {0}")]
    InvalidChannels(String),

    /// `replace_stride_with_dilation` was present, but not 3 elements long.
    #[error(
        "replace_stride_with_dilation should be None or a 3-element sequence, got {len} elements"
    )]
    InvalidDilationPolicy {
        /// The observed policy length.
        len: usize,
    },

    /// A basic block was configured with grouping or widening.
    #[error(
        "BasicBlock only supports groups=1 and base_width=64, got groups={groups} and base_width={base_width}"
    )]
    BasicBlockGroups {
        /// The requested groups.
        groups: usize,

        /// The requested base width.
        base_width: usize,
    },

    /// A basic block was configured with dilation.
    #[error("Dilation > 1 not supported in BasicBlock, got dilation={dilation}")]
    BasicBlockDilation {
        /// The requested dilation.
        dilation: usize,
    },

    /// A residual block changes shape, but has no projection shortcut.
    #[error("invalid shortcut: {0}")]
    InvalidShortcut(String),

    /// A stage (or the stage sequence) is empty or does not chain.
    #[error("invalid stage: {0}")]
    InvalidStage(String),

    /// No preset is registered under the name.
    #[error("unknown preset: {name}")]
    UnknownPreset {
        /// The requested preset name.
        name: String,
    },

    /// The preset has no registered pretrained weights.
    #[error("no pretrained weights registered for preset: {name}")]
    NoPretrainedWeights {
        /// The preset name.
        name: String,
    },

    /// The pretrained weights do not exactly match the assembled graph.
    ///
    /// Nothing is applied when this is returned.
    #[error(
        "pretrained weights do not match the model; missing: {missing:?}, unexpected: {unexpected:?}, mismatched: {mismatched:?}"
    )]
    WeightMismatch {
        /// Model paths absent from the weights.
        missing: Vec<String>,

        /// Weight paths absent from the model.
        unexpected: Vec<String>,

        /// ``"{path}: expected {shape}, got {shape}"`` descriptions.
        mismatched: Vec<String>,
    },

    /// The weight fetch collaborator failed.
    #[error("failed to fetch pretrained weights: {0}")]
    WeightFetch(anyhow::Error),
}

/// `Result` alias for [`ResNetError`].
pub type ResNetResult<T> = Result<T, ResNetError>;
