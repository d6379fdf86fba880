//! # `ResNet` Utilities

/// Get the output resolution of a stride, for the padded convolutions of `ResNet`.
///
/// Every `ResNet` convolution and pool is padded so that
/// ``out = ceil(in / stride)``, independent of kernel size and dilation.
///
/// # Arguments
///
/// - `input_resolution`: ``[height_in, width_in]``.
///
/// # Returns
///
/// ``[ceil(height_in / stride), ceil(width_in / stride)]``
#[inline(always)]
pub fn stride_div_output_resolution(
    input_resolution: [usize; 2],
    stride: usize,
) -> [usize; 2] {
    [
        input_resolution[0].div_ceil(stride),
        input_resolution[1].div_ceil(stride),
    ]
}
