/// An error that can occur while declaring parameters or building layers.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// An argument was not one of the supported values, for example an unknown initializer.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A parameter with the same name was already declared in this scope.
    #[error("Parameter '{0}' is already declared; pass a reuse policy to share it")]
    NamingCollision(String),
    /// A parameter was requested for reuse but was never declared.
    #[error("Parameter '{0}' was requested for reuse but does not exist")]
    MissingParameter(String),
    /// A tensor did not have the shape a parameter or statistic requires.
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The parameter or statistic that was checked.
        name: String,
        /// The shape that was required.
        expected: Vec<usize>,
        /// The shape that was found.
        actual: Vec<usize>,
    },
    /// An error from the tensor backend.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// A result with a [`LayerError`].
pub type Result<T> = std::result::Result<T, LayerError>;
