//! # Convolution Layer Factories
//!
//! [`conv3x3`] and [`conv1x1`] describe the two convolutions every
//! residual block is built from. They are pure config generators;
//! nothing is allocated until the config is initialized.

use crate::compat::conv_shape::expect_conv2d_config_output_shape;
use crate::errors::{ResNetError, ResNetResult};
use burn::nn::conv::Conv2dConfig;
use burn::nn::{Initializer, PaddingConfig2d};

/// Kaiming fan-out normal init, for convolutions feeding a ``ReLU``.
pub const CONV_INTO_RELU_INITIALIZER: Initializer = Initializer::KaimingNormal {
    gain: std::f64::consts::SQRT_2,
    fan_out_only: true,
};

fn check_channels(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
) -> ResNetResult<()> {
    if in_planes == 0 || out_planes == 0 {
        return Err(ResNetError::InvalidChannels(format!(
            "channels must be positive, got in_planes={in_planes}, out_planes={out_planes}"
        )));
    }
    if groups == 0 || in_planes % groups != 0 || out_planes % groups != 0 {
        return Err(ResNetError::InvalidChannels(format!(
            "in_planes={in_planes} and out_planes={out_planes} must be divisible by groups={groups}"
        )));
    }
    if stride == 0 || dilation == 0 {
        return Err(ResNetError::InvalidChannels(format!(
            "stride and dilation must be positive, got stride={stride}, dilation={dilation}"
        )));
    }
    Ok(())
}

/// 3x3 convolution, with ``padding = dilation``.
///
/// With that padding the output resolution depends only on the stride:
/// ``out = ceil(in / stride)``, for any dilation.
///
/// # Returns
///
/// A bias-free [`Conv2dConfig`]; or [`ResNetError::InvalidChannels`].
pub fn conv3x3(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
) -> ResNetResult<Conv2dConfig> {
    check_channels(in_planes, out_planes, stride, groups, dilation)?;
    Ok(Conv2dConfig::new([in_planes, out_planes], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
        .with_dilation([dilation, dilation])
        .with_groups(groups)
        .with_bias(false)
        .with_initializer(CONV_INTO_RELU_INITIALIZER))
}

/// 1x1 convolution, without padding.
///
/// Used for channel projection, and for the subsampling of projection shortcuts.
///
/// # Returns
///
/// A bias-free [`Conv2dConfig`]; or [`ResNetError::InvalidChannels`].
pub fn conv1x1(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
) -> ResNetResult<Conv2dConfig> {
    check_channels(in_planes, out_planes, stride, 1, 1)?;
    Ok(Conv2dConfig::new([in_planes, out_planes], [1, 1])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(0, 0))
        .with_bias(false)
        .with_initializer(CONV_INTO_RELU_INITIALIZER))
}

/// Output resolution of a conv config.
///
/// # Panics
///
/// If the input is too small for the kernel.
pub fn conv_output_resolution(
    config: &Conv2dConfig,
    input_resolution: [usize; 2],
) -> [usize; 2] {
    expect_conv2d_config_output_shape(config, input_resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;
    use burn::nn::conv::Conv2d;
    use burn::prelude::Tensor;
    use burn::tensor::Distribution;

    #[test]
    fn test_conv3x3_config() {
        let config = conv3x3(16, 32, 2, 1, 3).unwrap();
        assert_eq!(config.channels, [16, 32]);
        assert_eq!(config.kernel_size, [3, 3]);
        assert_eq!(config.stride, [2, 2]);
        assert_eq!(config.dilation, [3, 3]);
        assert_eq!(config.groups, 1);
        assert!(!config.bias);
        assert!(matches!(config.padding, PaddingConfig2d::Explicit(3, 3)));
    }

    #[test]
    fn test_conv1x1_config() {
        let config = conv1x1(64, 256, 2).unwrap();
        assert_eq!(config.channels, [64, 256]);
        assert_eq!(config.kernel_size, [1, 1]);
        assert_eq!(config.stride, [2, 2]);
        assert!(!config.bias);
        assert!(matches!(config.padding, PaddingConfig2d::Explicit(0, 0)));
    }

    #[test]
    fn test_invalid_channels() {
        assert!(matches!(
            conv3x3(0, 8, 1, 1, 1),
            Err(ResNetError::InvalidChannels(_))
        ));
        assert!(matches!(
            conv3x3(8, 12, 1, 8, 1),
            Err(ResNetError::InvalidChannels(_))
        ));
        assert!(matches!(
            conv1x1(8, 0, 1),
            Err(ResNetError::InvalidChannels(_))
        ));
        assert!(matches!(
            conv1x1(8, 8, 0),
            Err(ResNetError::InvalidChannels(_))
        ));
    }

    #[test]
    fn test_output_resolution_independent_of_dilation() {
        for dilation in 1..5 {
            for stride in [1, 2] {
                let config = conv3x3(4, 4, stride, 1, dilation).unwrap();
                assert_eq!(
                    conv_output_resolution(&config, [28, 27]),
                    [28usize.div_ceil(stride), 27usize.div_ceil(stride)]
                );
            }
        }
    }

    #[test]
    fn test_dilated_conv_forward() {
        type B = NdArray<f32>;
        let device = Default::default();

        let config = conv3x3(2, 3, 1, 1, 2).unwrap();
        let conv: Conv2d<B> = config.init(&device);

        let input: Tensor<B, 4> = Tensor::random([2, 2, 9, 9], Distribution::Default, &device);
        let output = conv.forward(input);
        assert_shape_contract!(
            ["batch", "channels", "height", "width"],
            &output,
            &[("batch", 2), ("channels", 3), ("height", 9), ("width", 9)]
        );
    }
}
