//! Error types shared by the patch optimizer and the zonotope certifier.

use thiserror::Error;

/// Result alias used across ζ-zono crates.
pub type Result<T> = std::result::Result<T, ZetaError>;

/// Errors raised by ζ-zono operations.
///
/// Every variant is fatal to the operation that produced it: nothing is
/// retried internally and no partial result is returned.
#[derive(Debug, Error)]
pub enum ZetaError {
    /// A configuration parameter is non-finite or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input data has the wrong rank or layout (e.g. flat feature vectors).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// A network layer has no zonotope counterpart.
    #[error("unsupported layer type: {0}")]
    UnsupportedLayer(String),

    /// Forward mode is unknown, or abstract mode was requested without error terms.
    #[error("invalid forward mode: {0}")]
    InvalidForwardMode(String),

    /// The external classifier failed to produce a result.
    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("layer {layer_index} ({layer_type}) failed: {source}")]
    LayerError {
        layer_index: usize,
        layer_type: String,
        #[source]
        source: Box<ZetaError>,
    },
}

impl ZetaError {
    /// Create a `ShapeMismatch`, panicking if the shapes are identical.
    ///
    /// Identical shapes mean the caller raised the error on a path where the
    /// shapes actually agree, which is a bug in the caller.
    #[track_caller]
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        if expected == got {
            let loc = std::panic::Location::caller();
            panic!(
                "BUG at {}:{}:{}: ShapeMismatch created with identical shapes: {:?}",
                loc.file(),
                loc.line(),
                loc.column(),
                expected
            );
        }
        ZetaError::ShapeMismatch { expected, got }
    }

    /// Wrap an error raised while evaluating a specific layer.
    pub fn in_layer(self, layer_index: usize, layer_type: impl Into<String>) -> Self {
        ZetaError::LayerError {
            layer_index,
            layer_type: layer_type.into(),
            source: Box::new(self),
        }
    }
}
