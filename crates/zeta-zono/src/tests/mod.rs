//! Unit tests for zeta-zono.

use crate::*;
use ndarray::{Array1, Array2, Array4};

mod layers;
mod model;

/// conv(1→2, 3x3) → ReLU → dense(8→3) over 1x4x4 inputs.
fn tiny_cnn() -> Vec<LayerSpec> {
    let kernel = Array4::from_shape_fn((2, 1, 3, 3), |(o, _, i, j)| {
        let sign = if o == 0 { 1.0 } else { -1.0 };
        sign * ((i * 3 + j) as f32 - 4.0) / 8.0
    });
    let dense = Array2::from_shape_fn((3, 8), |(r, c)| ((r * 8 + c) % 5) as f32 / 4.0 - 0.5);
    vec![
        LayerSpec::conv2d(
            "conv1",
            kernel,
            Some(Array1::from(vec![0.1, -0.2])),
            (1, 1),
            (0, 0),
            (1, 1),
        ),
        LayerSpec::relu("relu1"),
        LayerSpec::linear("fc1", dense, Some(Array1::from(vec![0.0, 0.5, -0.5]))),
    ]
}

struct TinyNet {
    input_shape: Vec<usize>,
    layers: Vec<LayerSpec>,
}

impl TinyNet {
    fn new() -> Self {
        Self {
            input_shape: vec![1, 4, 4],
            layers: tiny_cnn(),
        }
    }
}

impl InspectableNetwork for TinyNet {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn channels_first(&self) -> bool {
        true
    }

    fn nb_classes(&self) -> usize {
        3
    }

    fn layers(&self) -> Vec<LayerSpec> {
        self.layers.clone()
    }
}

/// `center + Σ coeffs[i]·e_i` for coefficients in `[-1, 1]`.
fn point_in(z: &Zonotope, coeffs: &[f32]) -> ndarray::ArrayD<f32> {
    z.vertex(coeffs).unwrap()
}
