//! Zonotopes over tensors of arbitrary shape.
//!
//! A zonotope is `{ c + Σ_i ε_i·e_i : ε_i ∈ [-1, 1] }`. It is stored stacked:
//! row 0 of the leading axis is the center `c`, rows `1..=k` are the error
//! terms `e_i`, and the remaining axes are the value shape. Linear layers act
//! on every row at once, which is why the stacked form is kept throughout
//! propagation.

use ndarray::{concatenate, Array2, ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use zeta_core::{Bound, Result, ZetaError};

#[derive(Debug, Clone, PartialEq)]
pub struct Zonotope {
    stacked: ArrayD<f32>,
}

impl Zonotope {
    /// Wrap a stacked `[1 + k, ...value_shape]` array.
    pub fn new(stacked: ArrayD<f32>) -> Result<Self> {
        if stacked.ndim() < 2 || stacked.len_of(Axis(0)) == 0 {
            return Err(ZetaError::InvalidInput(format!(
                "stacked zonotope needs a center row and a value shape, got shape {:?}",
                stacked.shape()
            )));
        }
        Ok(Self { stacked })
    }

    /// Build from a center of the value shape and `[k, ...value_shape]` error terms.
    pub fn from_parts(center: ArrayViewD<'_, f32>, error_terms: ArrayViewD<'_, f32>) -> Result<Self> {
        if error_terms.ndim() != center.ndim() + 1 || error_terms.shape()[1..] != *center.shape() {
            let mut expected = vec![error_terms.shape().first().copied().unwrap_or(0)];
            expected.extend_from_slice(center.shape());
            return Err(ZetaError::shape_mismatch(expected, error_terms.shape().to_vec()));
        }
        let center = center.insert_axis(Axis(0));
        let stacked = concatenate(Axis(0), &[center.view(), error_terms.view()]).map_err(|e| {
            ZetaError::InvalidInput(format!("cannot stack zonotope rows: {}", e))
        })?;
        Self::new(stacked)
    }

    /// The L∞ ball of radius `eps` around `center`: one error term per
    /// dimension, holding `eps` at that dimension and zero elsewhere.
    pub fn from_linf_ball(center: ArrayViewD<'_, f32>, eps: f32) -> Result<Self> {
        if !eps.is_finite() || eps < 0.0 {
            return Err(ZetaError::InvalidConfig(format!(
                "epsilon must be finite and non-negative, got {}",
                eps
            )));
        }
        let n = center.len();
        let mut shape = vec![n + 1];
        shape.extend_from_slice(center.shape());

        let mut flat = Array2::<f32>::zeros((n + 1, n));
        for (dst, src) in flat.row_mut(0).iter_mut().zip(center.iter()) {
            *dst = *src;
        }
        for i in 0..n {
            flat[[i + 1, i]] = eps;
        }
        let stacked = flat
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| ZetaError::InvalidInput(format!("cannot shape L-inf ball: {}", e)))?;
        Self::new(stacked)
    }

    pub fn center(&self) -> ArrayViewD<'_, f32> {
        self.stacked.index_axis(Axis(0), 0)
    }

    /// `[k, ...value_shape]`
    pub fn error_terms(&self) -> ArrayViewD<'_, f32> {
        self.stacked.slice_axis(Axis(0), Slice::from(1..))
    }

    pub fn num_error_terms(&self) -> usize {
        self.stacked.len_of(Axis(0)) - 1
    }

    pub fn value_shape(&self) -> &[usize] {
        &self.stacked.shape()[1..]
    }

    pub fn stacked(&self) -> &ArrayD<f32> {
        &self.stacked
    }

    pub fn into_stacked(self) -> ArrayD<f32> {
        self.stacked
    }

    /// `Σ|e_i|` per dimension.
    pub fn radius(&self) -> ArrayD<f32> {
        self.error_terms().mapv(f32::abs).sum_axis(Axis(0))
    }

    /// Per-dimension `(center - radius, center + radius)`.
    pub fn bounds(&self) -> (ArrayD<f32>, ArrayD<f32>) {
        let radius = self.radius();
        let lower = Zip::from(&self.center()).and(&radius).map_collect(|&c, &r| c - r);
        let upper = Zip::from(&self.center()).and(&radius).map_collect(|&c, &r| c + r);
        (lower, upper)
    }

    /// [`bounds`](Self::bounds) flattened in row-major order.
    pub fn interval_bounds(&self) -> Vec<Bound> {
        let (lower, upper) = self.bounds();
        lower
            .iter()
            .zip(upper.iter())
            .map(|(&l, &u)| Bound { lower: l, upper: u })
            .collect()
    }

    /// Whether `point` lies within the interval hull, widened by `tol`.
    ///
    /// Points of another shape are never contained.
    pub fn contains(&self, point: ArrayViewD<'_, f32>, tol: f32) -> bool {
        if point.shape() != self.value_shape() {
            return false;
        }
        let (lower, upper) = self.bounds();
        Zip::from(&point)
            .and(&lower)
            .and(&upper)
            .all(|&p, &l, &u| p >= l - tol && p <= u + tol)
    }

    /// Collapse the value shape into one axis: `[1 + k, prod(value_shape)]`.
    pub fn reshape_rows(&self) -> Result<Self> {
        let rows = self.stacked.len_of(Axis(0));
        let width: usize = self.value_shape().iter().product();
        self.reshaped(&[rows, width])
    }

    /// Reshape every row to `value_shape`, keeping row-major element order.
    pub fn with_value_shape(&self, value_shape: &[usize]) -> Result<Self> {
        let mut shape = vec![self.stacked.len_of(Axis(0))];
        shape.extend_from_slice(value_shape);
        self.reshaped(&shape)
    }

    fn reshaped(&self, shape: &[usize]) -> Result<Self> {
        let reshaped = self
            .stacked
            .to_shape(IxDyn(shape))
            .map_err(|_| {
                ZetaError::shape_mismatch(shape.to_vec(), self.stacked.shape().to_vec())
            })?
            .into_owned();
        Self::new(reshaped)
    }

    /// `c + Σ coeffs[i]·e_i`. Coefficients of `±1` give the corners.
    pub fn vertex(&self, coeffs: &[f32]) -> Result<ArrayD<f32>> {
        if coeffs.len() != self.num_error_terms() {
            return Err(ZetaError::shape_mismatch(
                vec![self.num_error_terms()],
                vec![coeffs.len()],
            ));
        }
        let mut point: ArrayD<f32> = self.center().to_owned();
        for (term, &s) in self.error_terms().axis_iter(Axis(0)).zip(coeffs) {
            point.scaled_add(s, &term);
        }
        Ok(point)
    }
}

impl From<Zonotope> for ArrayD<f32> {
    fn from(z: Zonotope) -> Self {
        z.stacked
    }
}

/// Stack a batch-of-one center `[1, ...]` with `[k, ...]` error terms.
pub(crate) fn stack_center(
    center: ArrayViewD<'_, f32>,
    error_terms: ArrayViewD<'_, f32>,
) -> Result<Zonotope> {
    if center.ndim() == 0 || center.len_of(Axis(0)) != 1 {
        let mut expected = vec![1];
        expected.extend_from_slice(error_terms.shape().get(1..).unwrap_or(&[]));
        return Err(ZetaError::shape_mismatch(expected, center.shape().to_vec()));
    }
    Zonotope::from_parts(center.index_axis(Axis(0), 0), error_terms)
}
