//! A stack of convolutional layers on NHWC feature maps.

use candle_core::{DType, Tensor};
use serde::Deserialize;

use crate::weights::{default_dtype, default_true, LayerWeights, WeightSettings};
use crate::{conv2d_same, pool2d_same, Activation, Parameter, PoolMode, Result, Scope};

fn unit_strides() -> [usize; 4] {
    [1, 1, 1, 1]
}

/// The pooling that follows a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PoolSpec {
    /// The reduction of each window.
    pub mode: PoolMode,
    /// The window, `[1, h, w, 1]`.
    pub size: [usize; 4],
    /// The strides, `[1, sh, sw, 1]`.
    pub strides: [usize; 4],
}

impl PoolSpec {
    /// Create a pooling spec.
    pub fn new(mode: PoolMode, size: [usize; 4], strides: [usize; 4]) -> Self {
        Self {
            mode,
            size,
            strides,
        }
    }
}

/// One convolutional layer: convolution, bias, activation and pooling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConvLayerSpec {
    /// `[kh, kw, c_in, c_out]`
    pub filter_shape: [usize; 4],
    /// `[1, sh, sw, 1]`
    ///
    /// Default: `[1, 1, 1, 1]`
    #[serde(default = "unit_strides")]
    pub strides: [usize; 4],
    /// Default: None
    #[serde(default)]
    pub activation: Option<Activation>,
    /// Default: None
    #[serde(default)]
    pub pool: Option<PoolSpec>,
    /// The initializer of the filter. `None` selects a truncated normal.
    #[serde(default)]
    pub init_method: Option<String>,
    /// The standard deviation passed to the initializer of the filter.
    #[serde(default)]
    pub init_std: Option<f64>,
}

impl ConvLayerSpec {
    /// A stride one convolution with no activation or pooling.
    pub fn new(filter_shape: [usize; 4]) -> Self {
        Self {
            filter_shape,
            strides: unit_strides(),
            activation: None,
            pool: None,
            init_method: None,
            init_std: None,
        }
    }

    /// Set the convolution strides.
    pub fn with_strides(mut self, strides: [usize; 4]) -> Self {
        self.strides = strides;
        self
    }

    /// Set the activation.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Set the pooling.
    pub fn with_pool(mut self, pool: PoolSpec) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the initializer of the filter.
    pub fn with_init(mut self, method: impl ToString, std: Option<f64>) -> Self {
        self.init_method = Some(method.to_string());
        self.init_std = std;
        self
    }

    /// Set the standard deviation of the default initializer.
    pub fn with_init_std(mut self, std: f64) -> Self {
        self.init_std = Some(std);
        self
    }
}

/// The settings of a [`Cnn`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CnnConfig {
    /// The layers, applied in order.
    pub layers: Vec<ConvLayerSpec>,
    /// Default: true
    #[serde(default = "default_true")]
    pub add_bias: bool,
    /// The weight decay of every filter. Biases never decay.
    #[serde(default)]
    pub weight_decay: Option<f64>,
    /// Default: [`DType::F32`]
    #[serde(skip, default = "default_dtype")]
    pub dtype: DType,
    /// Default: true
    #[serde(default = "default_true")]
    pub trainable: bool,
}

impl CnnConfig {
    /// Create a config with biases and no weight decay.
    pub fn new(layers: impl Into<Vec<ConvLayerSpec>>) -> Self {
        Self {
            layers: layers.into(),
            add_bias: true,
            weight_decay: None,
            dtype: default_dtype(),
            trainable: true,
        }
    }

    /// Set whether layers have a bias.
    pub fn with_bias(mut self, add_bias: bool) -> Self {
        self.add_bias = add_bias;
        self
    }

    /// Set the weight decay of the filters.
    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    /// Set the data type of the parameters.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set whether the parameters are trainable.
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }
}

#[derive(Debug, Clone)]
struct ConvLayer {
    weights: LayerWeights,
    strides: [usize; 4],
    activation: Option<Activation>,
    pool: Option<PoolSpec>,
    span: tracing::Span,
}

impl ConvLayer {
    fn new(scope: &Scope, spec: &ConvLayerSpec, config: &CnnConfig) -> Result<Self> {
        let settings = WeightSettings {
            init_method: spec.init_method.as_deref(),
            init_std: spec.init_std,
            add_bias: config.add_bias,
            weight_decay: config.weight_decay,
            dtype: config.dtype,
            trainable: config.trainable,
        };
        let weights = LayerWeights::declare(scope, &spec.filter_shape, &settings)?;
        Ok(Self {
            weights,
            strides: spec.strides,
            activation: spec.activation,
            pool: spec.pool,
            span: tracing::span!(tracing::Level::TRACE, "conv"),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let filter = self.weights.weight_on(xs.device())?;
        let ys = conv2d_same(xs, &filter, self.strides)?;
        let ys = self.weights.add_bias(ys)?;
        let ys = match &self.activation {
            Some(activation) => activation.forward(&ys)?,
            None => ys,
        };
        match &self.pool {
            Some(pool) => pool2d_same(&ys, pool.mode, pool.size, pool.strides),
            None => Ok(ys),
        }
    }
}

/// A stack of convolutional layers. Layer `i` declares `layer_{i}.w` and `layer_{i}.b` in its scope.
#[derive(Debug, Clone)]
pub struct Cnn {
    layers: Vec<ConvLayer>,
    span: tracing::Span,
}

impl Cnn {
    /// Declare the parameters of every layer in `scope`.
    pub fn new(scope: &Scope, config: &CnnConfig) -> Result<Self> {
        let layers = config
            .layers
            .iter()
            .enumerate()
            .map(|(index, spec)| ConvLayer::new(&scope.pp(format!("layer_{index}")), spec, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            span: tracing::span!(tracing::Level::TRACE, "cnn"),
        })
    }

    /// The number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The filter of layer `index`.
    pub fn filter(&self, index: usize) -> Option<&Parameter> {
        self.layers.get(index).map(|layer| layer.weights.w())
    }

    /// The bias of layer `index`, if the stack has biases.
    pub fn bias(&self, index: usize) -> Option<&Parameter> {
        self.layers.get(index).and_then(|layer| layer.weights.b())
    }

    /// Run `xs` (`[batch, height, width, channel]`) through every layer.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut hidden_states = xs.clone();
        for layer in self.layers.iter() {
            hidden_states = layer.forward(&hidden_states)?;
        }
        Ok(hidden_states)
    }
}

/// Declare a [`Cnn`] in `scope` and apply it to `xs` once.
pub fn cnn(scope: &Scope, xs: &Tensor, config: &CnnConfig) -> Result<Tensor> {
    Cnn::new(scope, config)?.forward(xs)
}
