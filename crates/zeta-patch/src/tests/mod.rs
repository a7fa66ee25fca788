//! Unit tests for zeta-patch.

use crate::*;
use ndarray::{Array3, Array4, ArrayView2, ArrayView4};
use std::cell::{Cell, RefCell};


/// Classifier stub returning the same gradient value everywhere.
struct ConstantGradient {
    input_shape: Vec<usize>,
    channels_first: bool,
    nb_classes: usize,
    clip: Bound,
    gradient: f32,
    queries: Cell<usize>,
    batch_sizes: RefCell<Vec<usize>>,
}

impl ConstantGradient {
    fn new(input_shape: &[usize], gradient: f32) -> Self {
        Self {
            input_shape: input_shape.to_vec(),
            channels_first: true,
            nb_classes: 10,
            clip: Bound::new(0.0, 1.0),
            gradient,
            queries: Cell::new(0),
            batch_sizes: RefCell::new(Vec::new()),
        }
    }

    fn channels_last(mut self) -> Self {
        self.channels_first = false;
        self
    }
}

impl Classifier for ConstantGradient {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn clip_values(&self) -> Bound {
        self.clip
    }

    fn channels_first(&self) -> bool {
        self.channels_first
    }

    fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    fn loss_gradient(
        &self,
        inputs: ArrayView4<'_, f32>,
        targets: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>> {
        assert_eq!(inputs.shape()[0], targets.shape()[0]);
        self.queries.set(self.queries.get() + 1);
        self.batch_sizes.borrow_mut().push(inputs.shape()[0]);
        Ok(Array4::from_elem(inputs.raw_dim(), self.gradient))
    }
}

/// Deterministic non-constant test image.
fn ramp_image(shape: (usize, usize, usize)) -> Array3<f32> {
    Array3::from_shape_fn(shape, |(a, b, c)| {
        ((a * 7 + b * 3 + c * 5) % 11) as f32 / 10.0
    })
}

/// Pixels of an `h × w` plane within `radius` of the plane center.
fn inner_disc(h: usize, w: usize, radius: f32) -> Vec<(usize, usize)> {
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let mut out = Vec::new();
    for i in 0..h {
        for j in 0..w {
            let (dy, dx) = (i as f32 - cy, j as f32 - cx);
            if (dy * dy + dx * dx).sqrt() <= radius {
                out.push((i, j));
            }
        }
    }
    out
}
