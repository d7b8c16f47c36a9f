use candle_core::Tensor;
use serde::Deserialize;

use crate::Result;

/// An elementwise nonlinearity applied after a layer's bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `max(x, 0)`
    Relu,
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// The hyperbolic tangent.
    Tanh,
    /// The exact (erf based) GELU.
    Gelu,
    /// The tanh approximation of GELU.
    GeluApproximate,
    /// ELU with `alpha = 1`.
    Elu,
    /// `ln(1 + e^x)`
    Softplus,
}

impl Activation {
    /// Apply the activation.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = match self {
            Self::Relu => xs.relu()?,
            Self::Sigmoid => candle_nn::ops::sigmoid(xs)?,
            Self::Tanh => xs.tanh()?,
            Self::Gelu => xs.gelu_erf()?,
            Self::GeluApproximate => xs.gelu()?,
            Self::Elu => xs.elu(1.0)?,
            // relu(x) + ln(1 + e^-|x|) stays finite for large inputs.
            Self::Softplus => (xs.relu()? + xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?)?,
        };
        Ok(ys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn relu_and_softplus() {
        let xs = Tensor::new(&[-1f32, 0., 2.], &Device::Cpu).unwrap();
        assert_eq!(
            Activation::Relu.forward(&xs).unwrap().to_vec1::<f32>().unwrap(),
            vec![0., 0., 2.]
        );
        let softplus = Activation::Softplus
            .forward(&xs)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((softplus[1] - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn softplus_is_finite_for_large_inputs() {
        let xs = Tensor::new(&[100f32, 20., -100.], &Device::Cpu).unwrap();
        let ys = Activation::Softplus
            .forward(&xs)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(ys.iter().all(|y| y.is_finite()), "{ys:?}");
        assert!((ys[0] - 100.).abs() < 1e-4);
        assert!((ys[1] - 20.).abs() < 1e-4);
        assert!(ys[2] >= 0. && ys[2] < 1e-6);
    }

    #[test]
    fn names_deserialize() {
        let act: Activation = serde_json::from_str(r#""gelu_approximate""#).unwrap();
        assert_eq!(act, Activation::GeluApproximate);
    }
}
