use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use super::{NormOutput, ScaleShift};
use crate::{conv1d_same, conv2d_same, LayerError, Result};

fn default_eps() -> f64 {
    1.0
}

/// What the suppression window of [`div_norm_2d`] is divided by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelScaling {
    /// Both kernels are divided by the area of the summation window.
    #[default]
    SumWindow,
    /// Each kernel is divided by its own area, so the suppression kernel is a true local mean.
    OwnWindow,
}

/// Settings for [`div_norm_2d`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DivNorm2dConfig {
    /// `[height, width]` of the window the mean is collected over.
    pub sum_window: [usize; 2],
    /// `[height, width]` of the window the variance is collected over.
    pub sup_window: [usize; 2],
    /// Default: `1.0`
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Default: [`KernelScaling::SumWindow`]
    #[serde(default)]
    pub kernel_scaling: KernelScaling,
}

impl DivNorm2dConfig {
    /// Create a config with the given windows.
    pub fn new(sum_window: [usize; 2], sup_window: [usize; 2]) -> Self {
        Self {
            sum_window,
            sup_window,
            eps: default_eps(),
            kernel_scaling: KernelScaling::default(),
        }
    }

    /// Set the denominator epsilon.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set how the suppression kernel is scaled.
    pub fn with_kernel_scaling(mut self, kernel_scaling: KernelScaling) -> Self {
        self.kernel_scaling = kernel_scaling;
        self
    }
}

/// Settings for [`div_norm_1d`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DivNorm1dConfig {
    /// The length of the window the mean is collected over.
    pub sum_window: usize,
    /// The length of the window the variance is collected over.
    pub sup_window: usize,
    /// Default: `1.0`
    #[serde(default = "default_eps")]
    pub eps: f64,
}

impl DivNorm1dConfig {
    /// Create a config with the given windows.
    pub fn new(sum_window: usize, sup_window: usize) -> Self {
        Self {
            sum_window,
            sup_window,
            eps: default_eps(),
        }
    }

    /// Set the denominator epsilon.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

fn check_windows(windows: &[usize]) -> Result<()> {
    if windows.contains(&0) {
        return Err(LayerError::InvalidArgument(format!(
            "normalization windows must be positive, got {windows:?}"
        )));
    }
    Ok(())
}

fn check_rank(xs: &Tensor, rank: usize) -> Result<()> {
    if xs.rank() != rank {
        return Err(LayerError::InvalidArgument(format!(
            "divisive normalization expects a rank {rank} input, got shape {:?}",
            xs.dims()
        )));
    }
    Ok(())
}

// A box kernel where every tap is `value`.
fn box_kernel(shape: &[usize], value: f64, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(value, shape, device)?.to_dtype(dtype)?)
}

/// Divisive normalization of an NHWC feature map over local windows, pooled across channels.
///
/// The mean is the channel mean averaged over `sum_window`; the variance is the channel mean of the
/// squared residual, summed over `sup_window` and scaled according to `kernel_scaling`. The returned mean
/// has shape `[batch, height, width, 1]`.
pub fn div_norm_2d(
    xs: &Tensor,
    scale_shift: ScaleShift,
    config: &DivNorm2dConfig,
) -> Result<NormOutput> {
    let _enter = tracing::span!(tracing::Level::TRACE, "div-norm-2d").entered();
    check_rank(xs, 4)?;
    check_windows(&config.sum_window)?;
    check_windows(&config.sup_window)?;
    let [sum_h, sum_w] = config.sum_window;
    let [sup_h, sup_w] = config.sup_window;
    let sum_area = (sum_h * sum_w) as f64;
    let sup_area = match config.kernel_scaling {
        KernelScaling::SumWindow => sum_area,
        KernelScaling::OwnWindow => (sup_h * sup_w) as f64,
    };
    let w_sum = box_kernel(&[sum_h, sum_w, 1, 1], 1.0 / sum_area, xs.dtype(), xs.device())?;
    let w_sup = box_kernel(&[sup_h, sup_w, 1, 1], 1.0 / sup_area, xs.dtype(), xs.device())?;

    let mean = conv2d_same(&xs.mean_keepdim(3)?, &w_sum, [1, 1, 1, 1])?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = conv2d_same(&centered.sqr()?.mean_keepdim(3)?, &w_sup, [1, 1, 1, 1])?;
    let output = centered.broadcast_div(&var.affine(1.0, config.eps)?.sqrt()?)?;
    Ok(NormOutput {
        output: scale_shift.apply(output)?,
        mean,
    })
}

/// Divisive normalization of `[batch, features]` activations over neighboring features.
///
/// Both windows are divided by their own length. The returned mean has the shape of `xs`.
pub fn div_norm_1d(
    xs: &Tensor,
    scale_shift: ScaleShift,
    config: &DivNorm1dConfig,
) -> Result<NormOutput> {
    let _enter = tracing::span!(tracing::Level::TRACE, "div-norm-1d").entered();
    check_rank(xs, 2)?;
    check_windows(&[config.sum_window, config.sup_window])?;
    let w_sum = box_kernel(
        &[1, 1, config.sum_window],
        1.0 / config.sum_window as f64,
        xs.dtype(),
        xs.device(),
    )?;
    let w_sup = box_kernel(
        &[1, 1, config.sup_window],
        1.0 / config.sup_window as f64,
        xs.dtype(),
        xs.device(),
    )?;

    let xs = xs.unsqueeze(1)?;
    let mean = conv1d_same(&xs, &w_sum, 1)?;
    let centered = (&xs - &mean)?;
    let var = conv1d_same(&centered.sqr()?, &w_sup, 1)?;
    let output = centered.broadcast_div(&var.affine(1.0, config.eps)?.sqrt()?)?;
    Ok(NormOutput {
        output: scale_shift.apply(output.squeeze(1)?)?,
        mean: mean.squeeze(1)?,
    })
}
