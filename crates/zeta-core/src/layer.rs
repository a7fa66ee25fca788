//! Descriptions of concrete network layers, as exposed by an external network.
//!
//! These are plain data: the zonotope crate decides which layer types it can
//! convert and rejects the rest.

use ndarray::{Array1, Array2, Array4, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Result, ZetaError};

/// Layer types a network may report.
///
/// Only `Conv2d`, `Linear` and `ReLU` have zonotope counterparts; the others
/// exist so that a network can describe itself faithfully and be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    Conv2d,
    Linear,
    ReLU,
    MaxPool2d,
    AvgPool2d,
    BatchNorm,
    Flatten,
    Dropout,
    Sigmoid,
    Tanh,
    Softmax,
    /// Anything the network could not map onto a known type.
    Other(String),
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerType::Other(name) => write!(f, "{}", name),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

/// One layer of a concrete network, in forward order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub layer_type: LayerType,
    /// Learned weight. Linear: `(out_features, in_features)`;
    /// Conv2d: `(out_channels, in_channels, kernel_h, kernel_w)`.
    pub weight: Option<ArrayD<f32>>,
    pub bias: Option<ArrayD<f32>>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl LayerSpec {
    /// A layer with no parameters.
    pub fn new(name: impl Into<String>, layer_type: LayerType) -> Self {
        Self {
            name: name.into(),
            layer_type,
            weight: None,
            bias: None,
            attributes: HashMap::new(),
        }
    }

    pub fn relu(name: impl Into<String>) -> Self {
        Self::new(name, LayerType::ReLU)
    }

    pub fn linear(name: impl Into<String>, weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight: Some(weight.into_dyn()),
            bias: bias.map(|b| b.into_dyn()),
            ..Self::new(name, LayerType::Linear)
        }
    }

    /// A 2-D convolution with per-axis `(h, w)` stride, padding and dilation.
    pub fn conv2d(
        name: impl Into<String>,
        weight: Array4<f32>,
        bias: Option<Array1<f32>>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
    ) -> Self {
        let kernel = (weight.shape()[2], weight.shape()[3]);
        let pair = |(a, b): (usize, usize)| AttributeValue::Ints(vec![a as i64, b as i64]);
        let mut attributes = HashMap::new();
        attributes.insert("kernel_size".to_string(), pair(kernel));
        attributes.insert("strides".to_string(), pair(stride));
        attributes.insert("pads".to_string(), pair(padding));
        attributes.insert("dilations".to_string(), pair(dilation));
        Self {
            weight: Some(weight.into_dyn()),
            bias: bias.map(|b| b.into_dyn()),
            attributes,
            ..Self::new(name, LayerType::Conv2d)
        }
    }

    /// Read a 2-element integer attribute as `(h, w)`, falling back to `default`.
    ///
    /// A single value applies to both axes. Negative values are rejected.
    pub fn attr_pair(&self, key: &str, default: (usize, usize)) -> Result<(usize, usize)> {
        let to_usize = |v: i64| {
            usize::try_from(v).map_err(|_| {
                ZetaError::InvalidConfig(format!(
                    "layer {} attribute {} has negative value {}",
                    self.name, key, v
                ))
            })
        };
        match self.attributes.get(key) {
            Some(AttributeValue::Ints(v)) if v.len() >= 2 => Ok((to_usize(v[0])?, to_usize(v[1])?)),
            Some(AttributeValue::Ints(v)) if !v.is_empty() => {
                let x = to_usize(v[0])?;
                Ok((x, x))
            }
            Some(AttributeValue::Int(v)) => {
                let x = to_usize(*v)?;
                Ok((x, x))
            }
            Some(other) => Err(ZetaError::InvalidConfig(format!(
                "layer {} attribute {} has unexpected value {:?}",
                self.name, key, other
            ))),
            None => Ok(default),
        }
    }
}
