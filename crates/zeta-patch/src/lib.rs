//! Adversarial patch generation.
//!
//! A patch is optimized so that, pasted onto arbitrary images under random
//! rotation, scaling and translation, it drives a classifier towards a target
//! label:
//! - [`transform`]: forward and inverse geometric transforms
//! - [`compositor`]: sampling transforms and pasting patches onto images
//! - [`optimizer`]: the gradient-descent loop over a dataset
//!
//! The classifier is an external collaborator implementing
//! [`zeta_core::Classifier`].

pub mod compositor;
pub mod config;
pub mod mask;
pub mod optimizer;
pub mod transform;

pub use compositor::{AugmentedBatch, PatchCompositor, TransformedPatch};
pub use config::{BatchingMode, PatchConfig, SamplingRange};
pub use mask::circular_mask;
pub use optimizer::{AdversarialPatch, OptimizerState, PatchResult};
pub use transform::{TransformEngine, TransformRecord};

pub use zeta_core::{Bound, Classifier, DataLayout, Result, ZetaError};

#[cfg(test)]
mod tests;
