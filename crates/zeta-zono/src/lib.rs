//! DeepZ robustness certification with zonotopes.
//!
//! A trained convolutional ReLU network is converted into an equivalent
//! network of [`AbstractLayer`]s that can push a whole input region, encoded
//! as a [`Zonotope`], through every layer:
//! - [`zonotope`]: the stacked center-plus-error-terms representation
//! - [`layers`]: convolution, dense and ReLU, concrete and abstract
//! - [`model`]: conversion and concrete/abstract forward passes
//! - [`certify`]: proving that no point of the region changes the prediction
//!
//! Reference: Singh et al. (2018), "Fast and Effective Robustness
//! Certification".

pub mod certify;
pub mod layers;
pub mod model;
pub mod zonotope;

pub use certify::{
    accuracy, certify_via_subtraction, max_logit_loss, CertificationReport, CertifyConfig,
    ClassMargin, DeepZCertifier,
};
pub use layers::{AbstractLayer, ZonoConv2d, ZonoDense, ZonoReLU, ZonotopePropagation};
pub use model::{ConvertedModel, ForwardMode, ForwardOutput};
pub use zonotope::Zonotope;

pub use zeta_core::{Bound, InspectableNetwork, LayerSpec, LayerType, Result, ZetaError};

#[cfg(test)]
mod tests;
