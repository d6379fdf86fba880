//! # Convolution Shape Arithmetic
//!
//! Predicts the spatial output shape of the 2d convolutions and pools
//! used by the `ResNet` builders, without allocating any weights.

use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::MaxPool2dConfig;

/// Predict the output size of one spatial dimension of a convolution.
///
/// ```text
/// out_size = floor( (in_size + 2*padding - dilation*(kernel_size-1) - 1) / stride ) + 1
/// ```
///
/// Pooling windows follow the same arithmetic with `dilation = 1`.
///
/// # Reference
///
/// - [pytorch conv2d](https://docs.pytorch.org/docs/stable/generated/torch.nn.Conv2d.html)
///
/// # Returns
///
/// `Some(out_size)`; or `None` when no window fits, or a parameter is zero.
pub fn maybe_conv1d_output_size(
    input_size: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    if input_size == 0 || kernel_size == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let padded = input_size + 2 * padding;
    let span = dilation * (kernel_size - 1) + 1;
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Predict the output shape of a 2d convolution.
///
/// This is the per-axis application of [`maybe_conv1d_output_size`].
pub fn maybe_conv2d_output_shape(
    input_shape: [usize; 2],
    kernel_shape: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
) -> Option<[usize; 2]> {
    Some([
        maybe_conv1d_output_size(
            input_shape[0],
            kernel_shape[0],
            stride[0],
            padding[0],
            dilation[0],
        )?,
        maybe_conv1d_output_size(
            input_shape[1],
            kernel_shape[1],
            stride[1],
            padding[1],
            dilation[1],
        )?,
    ])
}

/// Resolve a static padding config to ``[height_padding, width_padding]``.
///
/// # Panics
///
/// On input-dependent (``Same``) padding.
pub fn expect_static_padding(padding: &PaddingConfig2d) -> [usize; 2] {
    match padding {
        PaddingConfig2d::Explicit(h, w) => [*h, *w],
        PaddingConfig2d::Valid => [0, 0],
        other => panic!("Unsupported padding: {other:?}"),
    }
}

/// Predict the output shape of a [`Conv2dConfig`] layer.
///
/// # Panics
///
/// On unsupported padding; or if the input is too small for the kernel.
pub fn expect_conv2d_config_output_shape(
    config: &Conv2dConfig,
    input_shape: [usize; 2],
) -> [usize; 2] {
    let padding = expect_static_padding(&config.padding);
    match maybe_conv2d_output_shape(
        input_shape,
        config.kernel_size,
        config.stride,
        padding,
        config.dilation,
    ) {
        Some(shape) => shape,
        None => panic!(
            "No legal output shape for conv2d with:\n input_shape:{input_shape:?}\n config:{config:?}"
        ),
    }
}

/// Predict the output shape of a [`MaxPool2dConfig`] layer.
///
/// # Panics
///
/// On unsupported padding; or if the input is too small for the window.
pub fn expect_max_pool2d_config_output_shape(
    config: &MaxPool2dConfig,
    input_shape: [usize; 2],
) -> [usize; 2] {
    let padding = expect_static_padding(&config.padding);
    match maybe_conv2d_output_shape(
        input_shape,
        config.kernel_size,
        config.strides,
        padding,
        [1, 1],
    ) {
        Some(shape) => shape,
        None => panic!(
            "No legal output shape for max_pool2d with:\n input_shape:{input_shape:?}\n config:{config:?}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv1d_output_size() {
        fn reference(
            input_size: usize,
            kernel_size: usize,
            stride: usize,
            padding: usize,
            dilation: usize,
        ) -> Option<usize> {
            let padded = (input_size + 2 * padding) as f64;
            let span = (1 + dilation * (kernel_size - 1)) as f64;
            let x = ((padded - span) / stride as f64).floor() + 1.0;
            if x < 1.0 { None } else { Some(x as usize) }
        }

        for input_size in 1..12 {
            for stride in 1..4 {
                for kernel_size in 1..8 {
                    for dilation in 1..4 {
                        for padding in 0..4 {
                            assert_eq!(
                                maybe_conv1d_output_size(
                                    input_size,
                                    kernel_size,
                                    stride,
                                    padding,
                                    dilation
                                ),
                                reference(input_size, kernel_size, stride, padding, dilation),
                            );
                        }
                    }
                }
            }
        }

        assert_eq!(maybe_conv1d_output_size(0, 3, 1, 1, 1), None);
        assert_eq!(maybe_conv1d_output_size(4, 3, 0, 1, 1), None);
    }

    #[test]
    fn test_padding_equal_to_dilation_only_depends_on_stride() {
        for input_size in 1usize..40 {
            for stride in 1..3 {
                let expected = input_size.div_ceil(stride);
                for dilation in 1..5 {
                    assert_eq!(
                        maybe_conv1d_output_size(input_size, 3, stride, dilation, dilation),
                        Some(expected),
                    );
                }
            }
        }
    }

    #[test]
    fn test_conv2d_config_output_shape() {
        let config = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3));
        assert_eq!(
            expect_conv2d_config_output_shape(&config, [224, 225]),
            [112, 113]
        );

        let config = Conv2dConfig::new([64, 128], [1, 1]).with_stride([2, 2]);
        assert_eq!(
            expect_conv2d_config_output_shape(&config, [56, 55]),
            [28, 28]
        );
    }

    #[test]
    fn test_max_pool2d_config_output_shape() {
        let config = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1));
        assert_eq!(
            expect_max_pool2d_config_output_shape(&config, [112, 113]),
            [56, 57]
        );
    }
}
