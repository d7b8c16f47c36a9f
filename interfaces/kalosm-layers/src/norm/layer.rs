use candle_core::Tensor;
use serde::Deserialize;

use super::{check_axes, standardize, NormOutput, ScaleShift};
use crate::Result;

/// Settings for [`layer_norm`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LayerNormConfig {
    /// The axes statistics are collected over. `None` means every axis except the batch axis.
    pub axes: Option<Vec<usize>>,
    /// Added to the variance before the square root.
    ///
    /// Default: `1e-3`
    pub eps: f64,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            axes: None,
            eps: 1e-3,
        }
    }
}

impl LayerNormConfig {
    /// Set the statistic axes.
    pub fn with_axes(mut self, axes: impl Into<Vec<usize>>) -> Self {
        self.axes = Some(axes.into());
        self
    }

    /// Set the variance epsilon.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

/// Normalize every example of `xs` with its own mean and variance.
///
/// The returned mean keeps the reduced axes with size one.
pub fn layer_norm(xs: &Tensor, scale_shift: ScaleShift, config: &LayerNormConfig) -> Result<NormOutput> {
    let _enter = tracing::span!(tracing::Level::TRACE, "layer-norm").entered();
    let axes = match &config.axes {
        Some(axes) => axes.clone(),
        None => (1..xs.rank()).collect(),
    };
    check_axes(xs, &axes)?;
    let mean = xs.mean_keepdim(axes.clone())?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(axes)?;
    let output = standardize(&centered, &var, config.eps)?;
    Ok(NormOutput {
        output: scale_shift.apply(output)?,
        mean,
    })
}
