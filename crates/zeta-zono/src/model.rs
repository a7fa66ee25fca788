//! Conversion of a concrete network into a zonotope-propagating one.
//!
//! Layers are converted one by one in forward order. The conversion has no
//! graph to consult, so the flatten between the convolutional and the dense
//! part is inferred from the layer sequence: it sits in front of the first
//! dense layer that directly follows a convolution, or follows a ReLU that
//! itself follows a convolution.

use ndarray::{ArrayD, ArrayViewD, Axis, Ix2, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use zeta_core::{argmax_rows, InspectableNetwork, LayerSpec, Result, ZetaError};

use crate::layers::{AbstractLayer, ZonotopePropagation};
use crate::zonotope::{stack_center, Zonotope};

/// Which evaluation [`ConvertedModel::forward`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardMode {
    Concrete,
    #[default]
    Abstract,
}

impl FromStr for ForwardMode {
    type Err = ZetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concrete" => Ok(ForwardMode::Concrete),
            "abstract" => Ok(ForwardMode::Abstract),
            other => Err(ZetaError::InvalidForwardMode(format!(
                "forward mode must be \"abstract\" or \"concrete\", got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardMode::Concrete => write!(f, "concrete"),
            ForwardMode::Abstract => write!(f, "abstract"),
        }
    }
}

/// Result of [`ConvertedModel::forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutput {
    /// Network output for a concrete batch.
    Concrete(ArrayD<f32>),
    /// Output zonotope: center row followed by error terms.
    Abstract(Zonotope),
}

impl ForwardOutput {
    pub fn into_concrete(self) -> Option<ArrayD<f32>> {
        match self {
            ForwardOutput::Concrete(out) => Some(out),
            ForwardOutput::Abstract(_) => None,
        }
    }

    pub fn into_zonotope(self) -> Option<Zonotope> {
        match self {
            ForwardOutput::Abstract(z) => Some(z),
            ForwardOutput::Concrete(_) => None,
        }
    }
}

/// A network whose layers all have zonotope counterparts.
#[derive(Debug, Clone)]
pub struct ConvertedModel {
    layers: Vec<AbstractLayer>,
    names: Vec<String>,
    reshape_index: Option<usize>,
    input_shape: Vec<usize>,
    mode: ForwardMode,
}

impl ConvertedModel {
    /// Convert `specs`, given in forward order, for inputs of `input_shape`.
    ///
    /// Fails on the first layer that is not a convolution, dense layer or
    /// ReLU; nothing is returned for the layers converted before it.
    pub fn from_layers(
        specs: &[LayerSpec],
        input_shape: &[usize],
        channels_first: bool,
    ) -> Result<Self> {
        if !channels_first {
            return Err(ZetaError::InvalidConfig(
                "zonotope conversion needs channels-first data".to_string(),
            ));
        }
        if input_shape.is_empty() {
            return Err(ZetaError::InvalidInput(
                "input shape must have at least one dimension".to_string(),
            ));
        }

        let mut layers = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let layer = AbstractLayer::from_spec(spec)?;
            debug!("Registered layer {} ({}) as {}", i, spec.name, layer.kind());
            layers.push(layer);
        }

        let reshape_index = infer_reshape(&layers);
        if let Some(idx) = reshape_index {
            debug!("Inferred reshape before layer {}", idx);
        }
        info!(
            "Converted {} layers for input shape {:?}",
            layers.len(),
            input_shape
        );

        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            layers,
            reshape_index,
            input_shape: input_shape.to_vec(),
            mode: ForwardMode::default(),
        })
    }

    /// Convert a network that can list its layers.
    pub fn from_network<N: InspectableNetwork + ?Sized>(network: &N) -> Result<Self> {
        Self::from_layers(
            &network.layers(),
            network.input_shape(),
            network.channels_first(),
        )
    }

    pub fn layers(&self) -> &[AbstractLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Index of the layer in front of which activations are flattened.
    pub fn reshape_index(&self) -> Option<usize> {
        self.reshape_index
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn forward_mode(&self) -> ForwardMode {
        self.mode
    }

    pub fn set_forward_mode(&mut self, mode: ForwardMode) {
        self.mode = mode;
    }

    /// One line per layer, with the inferred flatten marked.
    pub fn layer_summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.layers.len() + 1);
        for (i, (layer, name)) in self.layers.iter().zip(&self.names).enumerate() {
            if self.reshape_index == Some(i) {
                lines.push("    -- reshape [rows, ...] -> [rows, features] --".to_string());
            }
            lines.push(format!("{:>3}  {:<12} {}", i, layer.kind(), name));
        }
        lines.join("\n")
    }

    /// Evaluate according to the current [`ForwardMode`].
    ///
    /// Concrete mode takes a batch `[N, ...input_shape]`. Abstract mode takes
    /// the zonotope center as a batch of one, `[1, ...input_shape]`, and
    /// requires `error_terms` of shape `[k, ...input_shape]`.
    pub fn forward(
        &self,
        input: ArrayViewD<'_, f32>,
        error_terms: Option<ArrayViewD<'_, f32>>,
    ) -> Result<ForwardOutput> {
        match (self.mode, error_terms) {
            (ForwardMode::Concrete, _) => self.concrete_forward(input).map(ForwardOutput::Concrete),
            (ForwardMode::Abstract, Some(eps)) => {
                let zonotope = stack_center(input, eps)?;
                self.abstract_forward(&zonotope).map(ForwardOutput::Abstract)
            }
            (ForwardMode::Abstract, None) => Err(ZetaError::InvalidForwardMode(
                "abstract forward needs error terms; pass them or switch to concrete mode"
                    .to_string(),
            )),
        }
    }

    /// Evaluate every layer concretely on `[N, ...input_shape]`.
    pub fn concrete_forward(&self, batch: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        if batch.ndim() != self.input_shape.len() + 1 || batch.shape()[1..] != self.input_shape[..] {
            let mut expected = vec![batch.shape().first().copied().unwrap_or(0)];
            expected.extend_from_slice(&self.input_shape);
            return Err(ZetaError::shape_mismatch(expected, batch.shape().to_vec()));
        }

        let mut x = batch.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            if self.reshape_index == Some(i) {
                x = flatten_rows(x).map_err(|e| e.in_layer(i, layer.kind()))?;
            }
            x = layer
                .concrete_forward(x.view())
                .map_err(|e| e.in_layer(i, layer.kind()))?;
        }
        Ok(x)
    }

    /// Propagate a zonotope over `input_shape` through every layer.
    pub fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope> {
        if input.value_shape() != self.input_shape.as_slice() {
            return Err(ZetaError::shape_mismatch(
                self.input_shape.clone(),
                input.value_shape().to_vec(),
            ));
        }

        let mut z = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if self.reshape_index == Some(i) {
                z = z.reshape_rows().map_err(|e| e.in_layer(i, layer.kind()))?;
            }
            z = layer
                .abstract_forward(&z)
                .map_err(|e| e.in_layer(i, layer.kind()))?;
            debug!(
                "Layer {} ({}): {} error terms",
                i,
                layer.kind(),
                z.num_error_terms()
            );
        }
        Ok(z)
    }

    /// Class with the largest output for one sample of `input_shape`.
    pub fn predict_class(&self, sample: ArrayViewD<'_, f32>) -> Result<usize> {
        if sample.shape() != self.input_shape.as_slice() {
            return Err(ZetaError::shape_mismatch(
                self.input_shape.clone(),
                sample.shape().to_vec(),
            ));
        }
        let out = self.concrete_forward(sample.insert_axis(Axis(0)))?;
        let logits = flatten_rows(out)?
            .into_dimensionality::<Ix2>()
            .map_err(|e| ZetaError::InvalidInput(format!("network output is not 2-D: {}", e)))?;
        argmax_rows(&logits)
            .first()
            .copied()
            .ok_or_else(|| ZetaError::InvalidInput("network produced no outputs".to_string()))
    }
}

fn infer_reshape(layers: &[AbstractLayer]) -> Option<usize> {
    (0..layers.len()).find(|&i| {
        layers[i].is_dense()
            && ((i >= 1 && layers[i - 1].is_conv())
                || (i >= 2 && layers[i - 1].is_relu() && layers[i - 2].is_conv()))
    })
}

/// `[rows, ...] -> [rows, features]`, row-major.
fn flatten_rows(x: ArrayD<f32>) -> Result<ArrayD<f32>> {
    let rows = x.shape().first().copied().unwrap_or(1);
    let features = x.shape().iter().skip(1).product::<usize>();
    let shape = [rows, features];
    let flat = x
        .to_shape(IxDyn(&shape))
        .map_err(|_| ZetaError::shape_mismatch(shape.to_vec(), x.shape().to_vec()))?
        .into_owned();
    Ok(flat)
}
