//! Core types and collaborator traits for ζ-zono.
//!
//! This crate holds what the patch optimizer and the zonotope certifier share:
//! the error type, scalar bounds, image layout, and the traits an external
//! classifier implements to be attacked or certified.

use ndarray::{Array4, ArrayView2, ArrayView4};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub mod error;
pub mod labels;
pub mod layer;

pub use error::{Result, ZetaError};
pub use labels::{argmax_rows, to_categorical};
pub use layer::{AttributeValue, LayerSpec, LayerType};

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f32,
    pub upper: f32,
}

impl Bound {
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Check if this bound contains a value.
    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.lower <= value && value <= self.upper
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.upper - self.lower
    }

    #[inline]
    pub fn midpoint(&self) -> f32 {
        (self.upper - self.lower) / 2.0 + self.lower
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.lower, self.upper)
    }
}

impl From<RangeInclusive<f32>> for Bound {
    fn from(range: RangeInclusive<f32>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// Memory layout of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLayout {
    /// `(channels, height, width)`
    ChannelsFirst,
    /// `(height, width, channels)`
    ChannelsLast,
}

impl DataLayout {
    pub fn from_channels_first(channels_first: bool) -> Self {
        if channels_first {
            DataLayout::ChannelsFirst
        } else {
            DataLayout::ChannelsLast
        }
    }

    /// Axis holding the channels in a 3-D image.
    pub fn channel_axis(&self) -> usize {
        match self {
            DataLayout::ChannelsFirst => 0,
            DataLayout::ChannelsLast => 2,
        }
    }

    /// `(height_axis, width_axis)` in a 3-D image.
    pub fn spatial_axes(&self) -> (usize, usize) {
        match self {
            DataLayout::ChannelsFirst => (1, 2),
            DataLayout::ChannelsLast => (0, 1),
        }
    }

    /// `(height, width)` of a 3-D image shape.
    pub fn spatial_dims(&self, shape: &[usize]) -> (usize, usize) {
        let (h, w) = self.spatial_axes();
        (shape[h], shape[w])
    }
}

/// A trained, differentiable image classifier.
///
/// The patch optimizer only needs metadata and input gradients; forward
/// inference stays behind the implementation.
pub trait Classifier {
    /// Shape of one input sample (3-D for image classifiers).
    fn input_shape(&self) -> &[usize];

    /// Valid input range.
    fn clip_values(&self) -> Bound;

    fn channels_first(&self) -> bool;

    fn nb_classes(&self) -> usize;

    /// Gradient of the loss with respect to `inputs`, for the given target
    /// label distribution (`inputs.len_of(Axis(0)) × nb_classes`).
    ///
    /// The returned array must have the same shape as `inputs`.
    fn loss_gradient(
        &self,
        inputs: ArrayView4<'_, f32>,
        targets: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>>;
}

/// A network that can enumerate its layers in forward order.
pub trait InspectableNetwork {
    /// Shape of one input sample.
    fn input_shape(&self) -> &[usize];

    fn channels_first(&self) -> bool;

    fn nb_classes(&self) -> usize;

    /// All layers, in the order they execute.
    fn layers(&self) -> Vec<LayerSpec>;
}
