//! Convolution and pooling with same-size padding on NHWC tensors.
//!
//! candle kernels work on NCHW tensors with symmetric padding. These helpers keep the
//! `[batch, height, width, channel]` layout at the boundary and pad like the SAME policy: the output has
//! `ceil(input / stride)` positions and any odd padding goes to the bottom/right.

use candle_core::Tensor;
use serde::Deserialize;

use crate::{LayerError, Result};

/// The reduction a pooling layer applies to each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// The largest value of the window.
    Max,
    /// The mean of the window, ignoring padded positions.
    Avg,
}

/// The padding before and after one axis.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    if input == 0 {
        return (0, 0);
    }
    let output = input.div_ceil(stride);
    let total = ((output - 1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

// Reads the spatial part of a `[1, h, w, 1]` window or stride.
fn spatial(values: [usize; 4], what: &str) -> Result<(usize, usize)> {
    match values {
        [1, h, w, 1] if h > 0 && w > 0 => Ok((h, w)),
        _ => Err(LayerError::InvalidArgument(format!(
            "{what} must have the form [1, h, w, 1] with positive h and w, got {values:?}"
        ))),
    }
}

fn subsample(xs: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    if stride == 1 {
        return Ok(xs.clone());
    }
    let len = xs.dim(dim)?;
    let index = Tensor::arange_step(0u32, len as u32, stride as u32, xs.device())?;
    Ok(xs.index_select(&index, dim)?)
}

/// Convolve an NHWC tensor with a `[kh, kw, c_in, c_out]` filter.
///
/// `strides` is `[1, sh, sw, 1]`; the height and width strides may differ.
pub fn conv2d_same(xs: &Tensor, filter: &Tensor, strides: [usize; 4]) -> Result<Tensor> {
    let (stride_h, stride_w) = spatial(strides, "convolution strides")?;
    let (_, height, width, channels) = xs.dims4()?;
    let (kernel_h, kernel_w, in_channels, out_channels) = filter.dims4()?;
    if channels != in_channels {
        return Err(LayerError::ShapeMismatch {
            name: "convolution filter".to_string(),
            expected: vec![kernel_h, kernel_w, channels, out_channels],
            actual: filter.dims().to_vec(),
        });
    }
    let (top, bottom) = same_padding(height, kernel_h, stride_h);
    let (left, right) = same_padding(width, kernel_w, stride_w);

    let xs = xs
        .permute((0, 3, 1, 2))?
        .pad_with_zeros(2, top, bottom)?
        .pad_with_zeros(3, left, right)?
        .contiguous()?;
    let kernel = filter.permute((3, 2, 0, 1))?.contiguous()?;
    let ys = if stride_h == stride_w {
        xs.conv2d(&kernel, 0, stride_h, 1, 1)?
    } else {
        let ys = xs.conv2d(&kernel, 0, 1, 1, 1)?;
        subsample(&subsample(&ys, 2, stride_h)?, 3, stride_w)?
    };
    Ok(ys.permute((0, 2, 3, 1))?)
}

/// Pool an NHWC tensor with a `[1, kh, kw, 1]` window and `[1, sh, sw, 1]` strides.
pub fn pool2d_same(
    xs: &Tensor,
    mode: PoolMode,
    size: [usize; 4],
    strides: [usize; 4],
) -> Result<Tensor> {
    let kernel = spatial(size, "pooling window")?;
    let stride = spatial(strides, "pooling strides")?;
    let (_, height, width, _) = xs.dims4()?;
    let (top, bottom) = same_padding(height, kernel.0, stride.0);
    let (left, right) = same_padding(width, kernel.1, stride.1);

    let xs = xs.permute((0, 3, 1, 2))?;
    let ys = match mode {
        // Repeating the edge never changes the maximum of a window that overlaps the border.
        PoolMode::Max => xs
            .pad_with_same(2, top, bottom)?
            .pad_with_same(3, left, right)?
            .contiguous()?
            .max_pool2d_with_stride(kernel, stride)?,
        PoolMode::Avg => {
            let sums = xs
                .pad_with_zeros(2, top, bottom)?
                .pad_with_zeros(3, left, right)?
                .contiguous()?
                .avg_pool2d_with_stride(kernel, stride)?;
            let valid = Tensor::ones((1, 1, height, width), xs.dtype(), xs.device())?
                .pad_with_zeros(2, top, bottom)?
                .pad_with_zeros(3, left, right)?
                .contiguous()?
                .avg_pool2d_with_stride(kernel, stride)?;
            sums.broadcast_div(&valid)?
        }
    };
    Ok(ys.permute((0, 2, 3, 1))?)
}

/// Convolve a `[batch, channel, length]` tensor with a `[c_out, c_in, k]` kernel.
pub fn conv1d_same(xs: &Tensor, kernel: &Tensor, stride: usize) -> Result<Tensor> {
    if stride == 0 {
        return Err(LayerError::InvalidArgument(
            "convolution stride must be positive".to_string(),
        ));
    }
    let (_, _, length) = xs.dims3()?;
    let (_, _, kernel_size) = kernel.dims3()?;
    let (left, right) = same_padding(length, kernel_size, stride);
    let xs = xs.pad_with_zeros(2, left, right)?.contiguous()?;
    Ok(xs.conv1d(kernel, 0, stride, 1, 1)?)
}
