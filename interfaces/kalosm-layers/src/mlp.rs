//! A stack of fully connected layers.

use candle_core::{DType, Tensor};
use candle_nn::{Dropout, ModuleT};
use serde::Deserialize;

use crate::weights::{default_dtype, default_true, LayerWeights, WeightSettings};
use crate::{Activation, Parameter, Result, Scope};

/// The probability a unit is dropped in training mode.
pub const DROPOUT_PROBABILITY: f32 = 0.5;

/// One fully connected layer: linear map, bias, activation and dropout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DenseLayerSpec {
    /// The number of output units.
    pub dim_out: usize,
    /// Default: None
    #[serde(default)]
    pub activation: Option<Activation>,
    /// Whether half of the outputs are dropped in training mode.
    ///
    /// Default: false
    #[serde(default)]
    pub dropout: bool,
    /// The initializer of the weight. `None` selects a truncated normal.
    #[serde(default)]
    pub init_method: Option<String>,
    /// The standard deviation passed to the initializer of the weight.
    #[serde(default)]
    pub init_std: Option<f64>,
}

impl DenseLayerSpec {
    /// A linear layer with `dim_out` outputs.
    pub fn new(dim_out: usize) -> Self {
        Self {
            dim_out,
            activation: None,
            dropout: false,
            init_method: None,
            init_std: None,
        }
    }

    /// Set the activation.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Set whether dropout follows the activation.
    pub fn with_dropout(mut self, dropout: bool) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the initializer of the weight.
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

/// The settings of an [`Mlp`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MlpConfig {
    /// The size of the last axis of the input.
    pub input_dim: usize,
    /// The layers, applied in order.
    pub layers: Vec<DenseLayerSpec>,
    /// Default: true
    #[serde(default = "default_true")]
    pub add_bias: bool,
    /// The weight decay of every weight. Biases never decay.
    #[serde(default)]
    pub weight_decay: Option<f64>,
    /// Default: [`DType::F32`]
    #[serde(skip, default = "default_dtype")]
    pub dtype: DType,
    /// Default: true
    #[serde(default = "default_true")]
    pub trainable: bool,
}

impl MlpConfig {
    /// Create a config with biases and no weight decay.
    pub fn new(input_dim: usize, layers: impl Into<Vec<DenseLayerSpec>>) -> Self {
        Self {
            input_dim,
            layers: layers.into(),
            add_bias: true,
            weight_decay: None,
            dtype: default_dtype(),
            trainable: true,
        }
    }

    /// The sizes of every layer boundary, starting with the input.
    pub fn dims(&self) -> Vec<usize> {
        std::iter::once(self.input_dim)
            .chain(self.layers.iter().map(|layer| layer.dim_out))
            .collect()
    }

    /// Set whether layers have a bias.
    pub fn with_bias(mut self, add_bias: bool) -> Self {
        self.add_bias = add_bias;
        self
    }

    /// Set the weight decay of the weights.
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
struct DenseLayer {
    weights: LayerWeights,
    activation: Option<Activation>,
    dropout: Option<Dropout>,
    span: tracing::Span,
}

impl DenseLayer {
    fn new(scope: &Scope, dim_in: usize, spec: &DenseLayerSpec, config: &MlpConfig) -> Result<Self> {
        let settings = WeightSettings {
            init_method: spec.init_method.as_deref(),
            init_std: spec.init_std,
            add_bias: config.add_bias,
            weight_decay: config.weight_decay,
            dtype: config.dtype,
            trainable: config.trainable,
        };
        let weights = LayerWeights::declare(scope, &[dim_in, spec.dim_out], &settings)?;
        let dropout = if spec.dropout {
            tracing::info!("Apply dropout {DROPOUT_PROBABILITY}");
            Some(Dropout::new(DROPOUT_PROBABILITY))
        } else {
            None
        };
        Ok(Self {
            weights,
            activation: spec.activation,
            dropout,
            span: tracing::span!(tracing::Level::TRACE, "dense"),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let w = self.weights.weight_on(xs.device())?;
        let ys = self.weights.add_bias(xs.broadcast_matmul(&w)?)?;
        let ys = match &self.activation {
            Some(activation) => activation.forward(&ys)?,
            None => ys,
        };
        match &self.dropout {
            Some(dropout) => Ok(dropout.forward_t(&ys, train)?),
            None => Ok(ys),
        }
    }
}

/// A stack of fully connected layers. Layer `i` declares `layer_{i}.w` (`[dim_in, dim_out]`) and
/// `layer_{i}.b` in its scope.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<DenseLayer>,
    span: tracing::Span,
}

impl Mlp {
    /// Declare the parameters of every layer in `scope`.
    pub fn new(scope: &Scope, config: &MlpConfig) -> Result<Self> {
        let dims = config.dims();
        let layers = config
            .layers
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                DenseLayer::new(&scope.pp(format!("layer_{index}")), dims[index], spec, config)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
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

    /// The weight of layer `index`.
    pub fn weight(&self, index: usize) -> Option<&Parameter> {
        self.layers.get(index).map(|layer| layer.weights.w())
    }

    /// The bias of layer `index`, if the stack has biases.
    pub fn bias(&self, index: usize) -> Option<&Parameter> {
        self.layers.get(index).and_then(|layer| layer.weights.b())
    }

    /// Run `xs` (`[batch, input_dim]`) through every layer. Dropout is only active when `train` is set.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut hidden_states = xs.clone();
        for layer in self.layers.iter() {
            hidden_states = layer.forward_t(&hidden_states, train)?;
        }
        Ok(hidden_states)
    }
}

/// Declare an [`Mlp`] in `scope` and apply it to `xs` once.
pub fn mlp(scope: &Scope, xs: &Tensor, config: &MlpConfig, train: bool) -> Result<Tensor> {
    Mlp::new(scope, config)?.forward_t(xs, train)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParameterStore;
    use candle_core::Device;
    use pretty_assertions::assert_eq;

    fn zero_fraction(xs: &Tensor) -> f32 {
        let values = xs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        values.iter().filter(|v| **v == 0.).count() as f32 / values.len() as f32
    }

    #[test]
    fn weights_follow_layer_dims() {
        let store = ParameterStore::new(&Device::Cpu);
        let config = MlpConfig::new(16, [DenseLayerSpec::new(32), DenseLayerSpec::new(4)]);
        assert_eq!(config.dims(), vec![16, 32, 4]);
        let mlp = Mlp::new(&store.scope("mlp"), &config).unwrap();
        assert_eq!(mlp.weight(0).unwrap().dims(), &[16, 32]);
        assert_eq!(mlp.weight(1).unwrap().name(), "mlp.layer_1.w");
        assert_eq!(mlp.bias(1).unwrap().dims(), &[4]);
    }

    #[test]
    fn linear_map_then_bias_then_activation() {
        let store = ParameterStore::new(&Device::Cpu);
        let config = MlpConfig::new(
            2,
            [DenseLayerSpec::new(2)
                .with_init("constant", None)
                .with_activation(Activation::Relu)],
        );
        let mlp = Mlp::new(&store.scope("mlp"), &config).unwrap();
        mlp.weight(0)
            .unwrap()
            .set(&Tensor::new(&[[1f32, -1.], [2., -2.]], &Device::Cpu).unwrap())
            .unwrap();
        mlp.bias(0)
            .unwrap()
            .set(&Tensor::new(&[1f32, 1.], &Device::Cpu).unwrap())
            .unwrap();

        let xs = Tensor::new(&[[1f32, 1.]], &Device::Cpu).unwrap();
        let ys = mlp.forward_t(&xs, true).unwrap();
        assert_eq!(ys.to_vec2::<f32>().unwrap(), vec![vec![4., 0.]]);
    }

    #[test]
    fn dropout_only_in_training() {
        let store = ParameterStore::new(&Device::Cpu);
        let config = MlpConfig::new(
            16,
            [DenseLayerSpec::new(256)
                .with_init("constant", None)
                .with_dropout(true)],
        )
        .with_bias(false);
        let mlp = Mlp::new(&store.scope("mlp"), &config).unwrap();
        mlp.weight(0)
            .unwrap()
            .set(&Tensor::ones((16, 256), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let xs = Tensor::ones((64, 16), DType::F32, &Device::Cpu).unwrap();

        let train = mlp.forward_t(&xs, true).unwrap();
        let fraction = zero_fraction(&train);
        assert!((0.45..0.55).contains(&fraction), "{fraction}");
        // Kept units are scaled by the inverse keep probability.
        let values = train.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0. || *v == 32.));

        let first = mlp.forward_t(&xs, false).unwrap();
        let second = mlp.forward_t(&xs, false).unwrap();
        assert_eq!(zero_fraction(&first), 0.);
        assert_eq!(
            first.to_vec2::<f32>().unwrap(),
            second.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn weight_decay_registers_a_penalty() {
        let store = ParameterStore::new(&Device::Cpu);
        let config = MlpConfig::new(2, [DenseLayerSpec::new(2).with_init("constant", None)])
            .with_weight_decay(0.1);
        let mlp = Mlp::new(&store.scope("mlp"), &config).unwrap();
        mlp.weight(0)
            .unwrap()
            .set(&Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap())
            .unwrap();
        let loss = store
            .regularization_loss()
            .unwrap()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 1.5).abs() < 1e-6);
    }

    #[test]
    fn config_deserializes() {
        let config: MlpConfig = serde_json::from_str(
            r#"{"input_dim": 8, "layers": [{"dim_out": 4, "activation": "tanh", "dropout": true}]}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            MlpConfig::new(
                8,
                [DenseLayerSpec::new(4)
                    .with_activation(Activation::Tanh)
                    .with_dropout(true)]
            )
        );
    }
}
