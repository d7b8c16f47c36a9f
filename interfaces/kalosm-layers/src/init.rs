//! Initializers for declared parameters.
//!
//! Initializers are usually chosen by name with [`Initializer::from_method`], which reads optional
//! settings from an [`InitParams`] map and falls back to documented defaults for any missing key.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::Normal;
use serde::Deserialize;

use crate::{LayerError, Result};

/// Optional settings for an initializer, keyed by name (`mean`, `stddev`, `factor`, `val`).
pub type InitParams = HashMap<String, f64>;

const DEFAULT_MEAN: f64 = 0.0;
const DEFAULT_STDDEV: f64 = 0.1;
const DEFAULT_FACTOR: f64 = 1.0;
const DEFAULT_VALUE: f64 = 0.0;

fn default_mean() -> f64 {
    DEFAULT_MEAN
}

fn default_stddev() -> f64 {
    DEFAULT_STDDEV
}

fn default_factor() -> f64 {
    DEFAULT_FACTOR
}

/// How the initial value of a parameter is generated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Initializer {
    /// Every element is zero. Used when no method is given.
    #[default]
    Zeros,
    /// A normal distribution where samples further than two standard deviations from the mean are redrawn.
    TruncatedNormal {
        /// Defaults to `0.0`
        #[serde(default = "default_mean")]
        mean: f64,
        /// Defaults to `0.1`
        #[serde(default = "default_stddev")]
        stddev: f64,
    },
    /// A uniform distribution in `[-m, m]` with `m = factor * sqrt(3 / input_size)`, where the input size is the
    /// product of every dimension but the last.
    UniformScaling {
        /// Defaults to `1.0`
        #[serde(default = "default_factor")]
        factor: f64,
    },
    /// Every element is `val`.
    Constant {
        /// Defaults to `0.0`
        #[serde(default)]
        val: f64,
    },
    /// The normal variant of the Glorot initializer: a truncated normal with mean 0 and
    /// `stddev = sqrt(1.3 / ((fan_in + fan_out) / 2))`.
    Xavier,
}

impl Initializer {
    /// Resolve an initializer from its method name.
    ///
    /// `None` and `"zeros"` select [`Initializer::Zeros`]. Missing keys in `params` fall back to the defaults of
    /// each method. Any other name fails with [`LayerError::InvalidArgument`].
    pub fn from_method(method: Option<&str>, params: &InitParams) -> Result<Self> {
        let param = |key: &str, default: f64| params.get(key).copied().unwrap_or(default);
        match method {
            None | Some("zeros") => Ok(Self::Zeros),
            Some("truncated_normal") => Ok(Self::TruncatedNormal {
                mean: param("mean", DEFAULT_MEAN),
                stddev: param("stddev", DEFAULT_STDDEV),
            }),
            Some("uniform_scaling") => Ok(Self::UniformScaling {
                factor: param("factor", DEFAULT_FACTOR),
            }),
            Some("constant") => Ok(Self::Constant {
                val: param("val", DEFAULT_VALUE),
            }),
            Some("xavier") => Ok(Self::Xavier),
            Some(other) => Err(LayerError::InvalidArgument(format!(
                "unsupported initialization method '{other}'"
            ))),
        }
    }

    /// The method name this initializer is selected by.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Zeros => "zeros",
            Self::TruncatedNormal { .. } => "truncated_normal",
            Self::UniformScaling { .. } => "uniform_scaling",
            Self::Constant { .. } => "constant",
            Self::Xavier => "xavier",
        }
    }

    /// Create the initial value of a parameter with the given shape.
    pub fn init<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Result<Tensor> {
        let count = shape.iter().product::<usize>();
        let tensor = match *self {
            Self::Zeros => Tensor::zeros(shape.to_vec(), dtype, device)?,
            Self::Constant { val } => Tensor::ones(shape.to_vec(), dtype, device)?.affine(val, 0.0)?,
            Self::TruncatedNormal { mean, stddev } => {
                let values = truncated_normal(mean, stddev, count, rng)?;
                Tensor::from_vec(values, shape.to_vec(), device)?.to_dtype(dtype)?
            }
            Self::UniformScaling { factor } => {
                let input_size = shape[..shape.len().saturating_sub(1)]
                    .iter()
                    .product::<usize>();
                let max_val = (factor * (3.0 / input_size as f64).sqrt()).abs();
                let between = Uniform::new_inclusive(-max_val, max_val);
                let values = (0..count)
                    .map(|_| between.sample(rng) as f32)
                    .collect::<Vec<_>>();
                Tensor::from_vec(values, shape.to_vec(), device)?.to_dtype(dtype)?
            }
            Self::Xavier => {
                let (fan_in, fan_out) = fans(shape);
                let stddev = (1.3 / ((fan_in + fan_out) / 2.0)).sqrt();
                let values = truncated_normal(0.0, stddev, count, rng)?;
                Tensor::from_vec(values, shape.to_vec(), device)?.to_dtype(dtype)?
            }
        };
        Ok(tensor)
    }
}

/// The number of inputs and outputs each weight element is connected to.
///
/// For convolution filters (`[kh, kw, c_in, c_out]`) the receptive field is folded into both fans.
pub(crate) fn fans(shape: &[usize]) -> (f64, f64) {
    match shape {
        [] => (1.0, 1.0),
        [size] => (*size as f64, *size as f64),
        [fan_in, fan_out] => (*fan_in as f64, *fan_out as f64),
        [receptive @ .., fan_in, fan_out] => {
            let receptive = receptive.iter().product::<usize>() as f64;
            (*fan_in as f64 * receptive, *fan_out as f64 * receptive)
        }
    }
}

fn truncated_normal<R: Rng + ?Sized>(
    mean: f64,
    stddev: f64,
    count: usize,
    rng: &mut R,
) -> Result<Vec<f32>> {
    let normal = Normal::new(mean, stddev).map_err(|err| {
        LayerError::InvalidArgument(format!(
            "invalid normal distribution (mean {mean}, stddev {stddev}): {err}"
        ))
    })?;
    let bound = 2.0 * stddev;
    Ok((0..count)
        .map(|_| loop {
            let value = normal.sample(rng);
            if (value - mean).abs() <= bound {
                break value as f32;
            }
        })
        .collect())
}
