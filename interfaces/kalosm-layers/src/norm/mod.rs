//! Feature normalization.
//!
//! Every normalizer computes `(x - mean) / sqrt(var + eps)` (or only `x - mean`) from some statistic of
//! the input, then optionally scales the result by `gamma` and shifts it by `beta`:
//!
//! - [`BatchNorm`] / [`batch_norm`]: statistics over the batch, with moving averages for evaluation.
//! - [`MeanOnlyBatchNorm`] / [`batch_norm_mean_only`]: like batch norm, but only the mean is removed.
//! - [`layer_norm`]: statistics per example.
//! - [`div_norm_2d`] / [`div_norm_1d`]: statistics over a local window.

mod batch;
pub use batch::*;
mod divisive;
pub use divisive::*;
mod layer;
pub use layer::*;

use candle_core::Tensor;

use crate::{Initializer, LayerError, Parameter, ParameterConfig, ReusePolicy, Result, Scope};

/// The decay of the moving averages batch normalization keeps.
pub const EMA_DECAY: f64 = 0.9;

/// The result of a normalization.
#[derive(Debug, Clone)]
pub struct NormOutput {
    /// The normalized tensor.
    pub output: Tensor,
    /// The mean that was subtracted.
    pub mean: Tensor,
}

/// The optional scale (`gamma`) and shift (`beta`) applied after normalization.
///
/// Both must broadcast against the normalized tensor. The scale is applied first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleShift<'a> {
    /// Multiplies the normalized tensor.
    pub gamma: Option<&'a Tensor>,
    /// Is added after `gamma`.
    pub beta: Option<&'a Tensor>,
}

impl<'a> ScaleShift<'a> {
    /// Create a scale and shift from optional tensors.
    pub fn new(gamma: Option<&'a Tensor>, beta: Option<&'a Tensor>) -> Self {
        Self { gamma, beta }
    }

    /// Neither scale nor shift.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&self, xs: Tensor) -> Result<Tensor> {
        let xs = match self.gamma {
            Some(gamma) => xs.broadcast_mul(&gamma.to_device(xs.device())?)?,
            None => xs,
        };
        let xs = match self.beta {
            Some(beta) => xs.broadcast_add(&beta.to_device(xs.device())?)?,
            None => xs,
        };
        Ok(xs)
    }
}

/// The values of the moving averages right after an update.
#[derive(Debug, Clone)]
pub struct EmaSnapshot {
    /// The updated mean.
    pub mean: Tensor,
    /// The updated variance, if the average tracks it.
    pub var: Option<Tensor>,
}

/// The persistent `ema_mean` (and optionally `ema_var`) of one normalization site.
///
/// Both averages are non trainable parameters shaped `[n_out]`, owned by the [`ParameterStore`](crate::ParameterStore).
/// The mean starts at zero and the variance at one.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    mean: Parameter,
    var: Option<Parameter>,
}

impl MovingAverage {
    /// Declare the averages of a site in `scope`.
    pub fn declare(
        scope: &Scope,
        n_out: usize,
        track_variance: bool,
        reuse: ReusePolicy,
    ) -> Result<Self> {
        let frozen = |initializer| {
            ParameterConfig::new([n_out])
                .with_initializer(initializer)
                .with_trainable(false)
                .with_reuse(reuse)
        };
        let mean = scope.declare("ema_mean", &frozen(Initializer::Zeros))?;
        let var = if track_variance {
            Some(scope.declare("ema_var", &frozen(Initializer::Constant { val: 1.0 }))?)
        } else {
            None
        };
        Ok(Self { mean, var })
    }

    /// The moving average of the mean.
    pub fn mean(&self) -> &Parameter {
        &self.mean
    }

    /// The moving average of the variance.
    pub fn var(&self) -> Option<&Parameter> {
        self.var.as_ref()
    }

    /// Fold a batch statistic into the averages: `ema = 0.9 * ema + 0.1 * batch`.
    pub fn update(&self, batch_mean: &Tensor, batch_var: Option<&Tensor>) -> Result<EmaSnapshot> {
        let mean = decay_into(&self.mean, batch_mean)?;
        let var = match (&self.var, batch_var) {
            (Some(ema), Some(batch_var)) => Some(decay_into(ema, batch_var)?),
            _ => None,
        };
        Ok(EmaSnapshot { mean, var })
    }
}

fn decay_into(ema: &Parameter, statistic: &Tensor) -> Result<Tensor> {
    let current = ema.as_tensor().detach();
    let statistic = statistic
        .detach()
        .to_device(current.device())?
        .to_dtype(current.dtype())?;
    let updated = (current.affine(EMA_DECAY, 0.0)? + statistic.affine(1.0 - EMA_DECAY, 0.0)?)?;
    ema.set(&updated)?;
    Ok(updated)
}

// Checks that `axes` is a non-empty set of valid, distinct axes of `xs`.
fn check_axes(xs: &Tensor, axes: &[usize]) -> Result<()> {
    let rank = xs.rank();
    let mut seen = vec![false; rank];
    for &axis in axes {
        if axis >= rank || seen[axis] {
            return Err(LayerError::InvalidArgument(format!(
                "invalid statistic axes {axes:?} for a tensor of shape {:?}",
                xs.dims()
            )));
        }
        seen[axis] = true;
    }
    if axes.is_empty() {
        return Err(LayerError::InvalidArgument(
            "at least one statistic axis is required".to_string(),
        ));
    }
    Ok(())
}

// `(centered) / sqrt(var + eps)` with `var` broadcast over the reduced axes.
fn standardize(centered: &Tensor, var: &Tensor, eps: f64) -> Result<Tensor> {
    Ok(centered.broadcast_div(&var.affine(1.0, eps)?.sqrt()?)?)
}
