#![warn(missing_docs)]

//! # Kalosm Layers
//!
//! Building blocks for convolutional and dense networks on top of candle.
//!
//! - [`ParameterStore`] and [`Scope`]: named, scoped parameter declaration with initializers, weight decay
//!   and checkpointing.
//! - Normalization: [`batch_norm`], [`batch_norm_mean_only`], [`layer_norm`], [`div_norm_2d`] and
//!   [`div_norm_1d`].
//! - Layer stacks: [`Cnn`] and [`Mlp`].
//!
//! Image tensors use the `[batch, height, width, channel]` layout.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod activation;
pub use activation::Activation;
mod cnn;
pub use cnn::*;
mod error;
pub use error::*;
mod init;
pub use init::*;
mod mlp;
pub use mlp::*;
mod norm;
pub use norm::*;
mod ops;
pub use ops::*;
mod store;
pub use store::*;
mod weights;
