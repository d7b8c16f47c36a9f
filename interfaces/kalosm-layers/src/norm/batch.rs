use candle_core::Tensor;
use serde::Deserialize;

use super::{check_axes, standardize, MovingAverage, NormOutput, ScaleShift};
use crate::{LayerError, Parameter, ReusePolicy, Result, Scope};

/// Settings shared by [`BatchNorm`] and [`MeanOnlyBatchNorm`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    /// The axes statistics are collected over. The remaining axes hold `n_out` features.
    ///
    /// Default: `[0, 1, 2]`
    pub axes: Vec<usize>,
    /// Added to the variance before the square root. Not used by [`MeanOnlyBatchNorm`].
    ///
    /// Default: `1e-3`
    pub eps: f64,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            axes: vec![0, 1, 2],
            eps: 1e-3,
        }
    }
}

impl BatchNormConfig {
    /// Set the statistic axes.
    pub fn with_axes(mut self, axes: impl Into<Vec<usize>>) -> Self {
        self.axes = axes.into();
        self
    }

    /// Set the variance epsilon.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

// The shape of a statistic that still broadcasts against `xs`, after checking it holds `n_out` features.
fn statistic_shape(xs: &Tensor, axes: &[usize], n_out: usize) -> Result<Vec<usize>> {
    check_axes(xs, axes)?;
    let mut shape = xs.dims().to_vec();
    for &axis in axes {
        shape[axis] = 1;
    }
    let features = shape.iter().product::<usize>();
    if features != n_out {
        return Err(LayerError::ShapeMismatch {
            name: "batch statistic".to_string(),
            expected: vec![n_out],
            actual: shape,
        });
    }
    Ok(shape)
}

// The moving average reshaped so it broadcasts against `xs`.
fn frozen_statistic(parameter: &Parameter, xs: &Tensor, shape: &[usize]) -> Result<Tensor> {
    Ok(parameter
        .on(xs.device())?
        .to_dtype(xs.dtype())?
        .reshape(shape.to_vec())?)
}

/// Batch normalization with moving averages of the mean and variance.
///
/// In training mode the input is normalized with the statistics of the batch and the moving averages are
/// updated; in evaluation mode the moving averages are used and nothing is mutated.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    n_out: usize,
    config: BatchNormConfig,
    state: MovingAverage,
    span: tracing::Span,
}

impl BatchNorm {
    /// Declare the `ema_mean` and `ema_var` of a batch norm site in `scope`.
    pub fn new(
        scope: &Scope,
        n_out: usize,
        config: BatchNormConfig,
        reuse: ReusePolicy,
    ) -> Result<Self> {
        let state = MovingAverage::declare(scope, n_out, true, reuse)?;
        Ok(Self {
            n_out,
            config,
            state,
            span: tracing::span!(tracing::Level::TRACE, "batch-norm"),
        })
    }

    /// The moving averages of this site.
    pub fn state(&self) -> &MovingAverage {
        &self.state
    }

    /// Normalize `xs`.
    ///
    /// The returned mean is the batch mean (`[n_out]`) in training mode and `ema_mean` in evaluation mode.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        scale_shift: ScaleShift,
        train: bool,
    ) -> Result<NormOutput> {
        let _enter = self.span.enter();
        let axes = self.config.axes.as_slice();
        let shape = statistic_shape(xs, axes, self.n_out)?;
        if train {
            let mean = xs.mean_keepdim(axes.to_vec())?;
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(axes.to_vec())?;
            let batch_mean = mean.flatten_all()?;
            // The averages are written before the output exists, even though the output uses the batch statistics.
            self.state.update(&batch_mean, Some(&var.flatten_all()?))?;
            let output = standardize(&centered, &var, self.config.eps)?;
            Ok(NormOutput {
                output: scale_shift.apply(output)?,
                mean: batch_mean,
            })
        } else {
            let mean = frozen_statistic(self.state.mean(), xs, &shape)?;
            let var = self
                .state
                .var()
                .ok_or_else(|| LayerError::MissingParameter("ema_var".to_string()))?;
            let var = frozen_statistic(var, xs, &shape)?;
            let centered = xs.broadcast_sub(&mean)?;
            let output = standardize(&centered, &var, self.config.eps)?;
            Ok(NormOutput {
                output: scale_shift.apply(output)?,
                mean: mean.flatten_all()?,
            })
        }
    }
}

/// Batch normalization that only removes the mean: `(x - mean) * gamma + beta`.
#[derive(Debug, Clone)]
pub struct MeanOnlyBatchNorm {
    n_out: usize,
    axes: Vec<usize>,
    state: MovingAverage,
    span: tracing::Span,
}

impl MeanOnlyBatchNorm {
    /// Declare the `ema_mean` of a mean-only batch norm site in `scope`.
    pub fn new(
        scope: &Scope,
        n_out: usize,
        config: BatchNormConfig,
        reuse: ReusePolicy,
    ) -> Result<Self> {
        let state = MovingAverage::declare(scope, n_out, false, reuse)?;
        Ok(Self {
            n_out,
            axes: config.axes,
            state,
            span: tracing::span!(tracing::Level::TRACE, "batch-norm-mean-only"),
        })
    }

    /// The moving average of this site.
    pub fn state(&self) -> &MovingAverage {
        &self.state
    }

    /// Remove the batch mean (training) or the moving average (evaluation) from `xs`.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        scale_shift: ScaleShift,
        train: bool,
    ) -> Result<NormOutput> {
        let _enter = self.span.enter();
        let shape = statistic_shape(xs, &self.axes, self.n_out)?;
        let mean = if train {
            let mean = xs.mean_keepdim(self.axes.clone())?;
            self.state.update(&mean.flatten_all()?, None)?;
            mean
        } else {
            frozen_statistic(self.state.mean(), xs, &shape)?
        };
        let output = xs.broadcast_sub(&mean)?;
        Ok(NormOutput {
            output: scale_shift.apply(output)?,
            mean: mean.flatten_all()?,
        })
    }
}

/// Apply batch normalization at the site `scope`, declaring its moving averages according to `reuse`.
///
/// Building the site once with [`BatchNorm::new`] avoids the lookup on every step.
pub fn batch_norm(
    scope: &Scope,
    xs: &Tensor,
    n_out: usize,
    train: bool,
    scale_shift: ScaleShift,
    config: &BatchNormConfig,
    reuse: ReusePolicy,
) -> Result<NormOutput> {
    BatchNorm::new(scope, n_out, config.clone(), reuse)?.forward_t(xs, scale_shift, train)
}

/// Apply mean-only batch normalization at the site `scope`, declaring its moving average according to `reuse`.
pub fn batch_norm_mean_only(
    scope: &Scope,
    xs: &Tensor,
    n_out: usize,
    train: bool,
    scale_shift: ScaleShift,
    config: &BatchNormConfig,
    reuse: ReusePolicy,
) -> Result<NormOutput> {
    MeanOnlyBatchNorm::new(scope, n_out, config.clone(), reuse)?.forward_t(xs, scale_shift, train)
}
