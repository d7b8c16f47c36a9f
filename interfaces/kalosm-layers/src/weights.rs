use candle_core::{DType, Device, Tensor};

use crate::{InitParams, Initializer, Parameter, ParameterConfig, Result, Scope};

/// The initializer a stack falls back to when a layer names none.
const DEFAULT_METHOD: &str = "truncated_normal";

pub(crate) fn default_dtype() -> DType {
    DType::F32
}

pub(crate) fn default_true() -> bool {
    true
}

/// How the weights of one layer of a stack are declared.
pub(crate) struct WeightSettings<'a> {
    pub(crate) init_method: Option<&'a str>,
    pub(crate) init_std: Option<f64>,
    pub(crate) add_bias: bool,
    pub(crate) weight_decay: Option<f64>,
    pub(crate) dtype: DType,
    pub(crate) trainable: bool,
}

/// The `w` and optional `b` of one layer.
#[derive(Debug, Clone)]
pub(crate) struct LayerWeights {
    w: Parameter,
    b: Option<Parameter>,
}

impl LayerWeights {
    /// Declare `w` with `shape` and `b` with the last dimension of `shape`.
    pub(crate) fn declare(
        scope: &Scope,
        shape: &[usize],
        settings: &WeightSettings,
    ) -> Result<Self> {
        let method = settings
            .init_method
            .filter(|method| !method.is_empty())
            .unwrap_or(DEFAULT_METHOD);
        let mut params = InitParams::from([("mean".to_string(), 0.0)]);
        if let Some(std) = settings.init_std {
            params.insert("stddev".to_string(), std);
        }
        let w = scope.declare(
            "w",
            &ParameterConfig::new(shape)
                .with_init_method(Some(method), &params)?
                .with_dtype(settings.dtype)
                .with_weight_decay(settings.weight_decay)
                .with_trainable(settings.trainable),
        )?;

        let b = if settings.add_bias {
            let outputs = shape.last().copied().unwrap_or_default();
            Some(
                scope.declare(
                    "b",
                    &ParameterConfig::new([outputs])
                        .with_initializer(Initializer::Constant { val: 0.0 })
                        .with_dtype(settings.dtype)
                        .with_trainable(settings.trainable),
                )?,
            )
        } else {
            None
        };
        Ok(Self { w, b })
    }

    pub(crate) fn w(&self) -> &Parameter {
        &self.w
    }

    pub(crate) fn b(&self) -> Option<&Parameter> {
        self.b.as_ref()
    }

    pub(crate) fn weight_on(&self, device: &Device) -> Result<Tensor> {
        self.w.on(device)
    }

    /// Add the bias, if the layer has one, along the last axis of `xs`.
    pub(crate) fn add_bias(&self, xs: Tensor) -> Result<Tensor> {
        match &self.b {
            Some(b) => Ok(xs.broadcast_add(&b.on(xs.device())?)?),
            None => Ok(xs),
        }
    }
}
