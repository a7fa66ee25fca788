//! Zonotope counterparts of convolution, dense and ReLU layers.
//!
//! Each layer evaluates both concretely, on an ordinary batch, and abstractly,
//! on a [`Zonotope`]. For the affine layers the abstract evaluation is the
//! linear part applied to every stacked row, with the bias added to the center
//! row only. ReLU uses the DeepZ relaxation (Singh et al., 2018).

use ndarray::{
    s, Array1, Array2, Array4, ArrayD, ArrayView2, ArrayView4, ArrayViewD, ArrayViewMut3, Axis, Ix1,
    Ix2, Ix4,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zeta_core::{LayerSpec, LayerType, Result, ZetaError};

use crate::zonotope::Zonotope;

/// Concrete and abstract evaluation of one layer.
pub trait ZonotopePropagation {
    /// Evaluate on a concrete batch whose leading axis is the batch axis.
    fn concrete_forward(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>>;

    /// Propagate a zonotope. The result contains every image of a point of
    /// `input` under the concrete layer.
    fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope>;
}

/// Fully connected layer: `x·Wᵀ + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonoDense {
    /// `(out_features, in_features)`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl ZonoDense {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let out_features = weight.nrows();
        let bias = bias.unwrap_or_else(|| Array1::zeros(out_features));
        if bias.len() != out_features {
            return Err(ZetaError::shape_mismatch(vec![out_features], vec![bias.len()]));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn rows<'a>(&self, input: ArrayViewD<'a, f32>) -> Result<ArrayView2<'a, f32>> {
        let got = input.shape().to_vec();
        let rows = input.into_dimensionality::<Ix2>().map_err(|_| {
            ZetaError::InvalidInput(format!(
                "dense layer expects 2-D input, got shape {:?}",
                got
            ))
        })?;
        if rows.ncols() != self.in_features() {
            return Err(ZetaError::shape_mismatch(
                vec![rows.nrows(), self.in_features()],
                got,
            ));
        }
        Ok(rows)
    }
}

impl ZonotopePropagation for ZonoDense {
    fn concrete_forward(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        let x = self.rows(input)?;
        Ok((x.dot(&self.weight.t()) + &self.bias).into_dyn())
    }

    fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope> {
        let rows = self.rows(input.stacked().view())?;
        let mut out = rows.dot(&self.weight.t());
        out.row_mut(0).scaled_add(1.0, &self.bias);
        Zonotope::new(out.into_dyn())
    }
}

/// 2-D cross-correlation over `[N, C, H, W]` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonoConv2d {
    /// `(out_channels, in_channels, kernel_h, kernel_w)`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
}

impl ZonoConv2d {
    pub fn new(
        weight: Array4<f32>,
        bias: Option<Array1<f32>>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
    ) -> Result<Self> {
        check_steps(stride, dilation)?;
        let out_channels = weight.shape()[0];
        let bias = bias.unwrap_or_else(|| Array1::zeros(out_channels));
        if bias.len() != out_channels {
            return Err(ZetaError::shape_mismatch(vec![out_channels], vec![bias.len()]));
        }
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
            dilation,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Spatial output size for an `h × w` input.
    ///
    /// The fields are public, so the step sizes are checked again here.
    pub fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        check_steps(self.stride, self.dilation)?;
        let (kh, kw) = (self.weight.shape()[2], self.weight.shape()[3]);
        let axis = |n: usize, k: usize, s: usize, p: usize, d: usize| -> Option<usize> {
            if k == 0 {
                return None;
            }
            let span = d * (k - 1) + 1;
            let padded = n + 2 * p;
            (padded >= span).then(|| (padded - span) / s + 1)
        };
        match (
            axis(h, kh, self.stride.0, self.padding.0, self.dilation.0),
            axis(w, kw, self.stride.1, self.padding.1, self.dilation.1),
        ) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(ZetaError::InvalidInput(format!(
                "conv kernel {}x{} (dilation {:?}, padding {:?}) does not fit a {}x{} input",
                kh, kw, self.dilation, self.padding, h, w
            ))),
        }
    }

    fn batch<'a>(&self, input: ArrayViewD<'a, f32>) -> Result<ArrayView4<'a, f32>> {
        let got = input.shape().to_vec();
        let x = input.into_dimensionality::<Ix4>().map_err(|_| {
            ZetaError::InvalidInput(format!(
                "conv layer expects [N, C, H, W] input, got shape {:?}",
                got
            ))
        })?;
        if x.shape()[1] != self.in_channels() {
            let mut expected = got.clone();
            expected[1] = self.in_channels();
            return Err(ZetaError::shape_mismatch(expected, got));
        }
        Ok(x)
    }

    /// Convolution without bias, via im2col and one matrix product per sample.
    fn correlate(&self, x: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (n, c_in, h, w) = x.dim();
        let (kh, kw) = (self.weight.shape()[2], self.weight.shape()[3]);
        let (oh, ow) = self.output_hw(h, w)?;
        let c_out = self.out_channels();
        let col_len = c_in * kh * kw;
        let patches = oh * ow;

        let kernel = self
            .weight
            .to_shape((c_out, col_len))
            .map_err(|e| ZetaError::InvalidInput(format!("cannot flatten conv kernel: {}", e)))?;

        let mut out = Array4::<f32>::zeros((n, c_out, oh, ow));
        let mut cols = Array2::<f32>::zeros((col_len, patches));
        for (sample, mut dst) in x.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            for c in 0..c_in {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = c * kh * kw + ky * kw + kx;
                        for oy in 0..oh {
                            for ox in 0..ow {
                                let iy = (oy * self.stride.0 + ky * self.dilation.0) as isize
                                    - self.padding.0 as isize;
                                let ix = (ox * self.stride.1 + kx * self.dilation.1) as isize
                                    - self.padding.1 as isize;
                                let inside = iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w;
                                cols[[row, oy * ow + ox]] = if inside {
                                    sample[[c, iy as usize, ix as usize]]
                                } else {
                                    0.0
                                };
                            }
                        }
                    }
                }
            }
            let product = kernel.dot(&cols);
            let product = product
                .into_shape_with_order((c_out, oh, ow))
                .map_err(|e| ZetaError::InvalidInput(format!("conv output reshape failed: {}", e)))?;
            dst.assign(&product);
        }
        Ok(out)
    }

    fn add_bias(&self, mut x: ArrayViewMut3<'_, f32>) {
        for (mut channel, &b) in x.axis_iter_mut(Axis(0)).zip(self.bias.iter()) {
            channel += b;
        }
    }
}

fn check_steps(stride: (usize, usize), dilation: (usize, usize)) -> Result<()> {
    if stride.0 == 0 || stride.1 == 0 || dilation.0 == 0 || dilation.1 == 0 {
        return Err(ZetaError::InvalidConfig(format!(
            "conv stride and dilation must be positive, got stride {:?}, dilation {:?}",
            stride, dilation
        )));
    }
    Ok(())
}

impl ZonotopePropagation for ZonoConv2d {
    fn concrete_forward(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        let x = self.batch(input)?;
        let mut out = self.correlate(x)?;
        for sample in out.axis_iter_mut(Axis(0)) {
            self.add_bias(sample);
        }
        Ok(out.into_dyn())
    }

    fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope> {
        let x = self.batch(input.stacked().view())?;
        let mut out = self.correlate(x)?;
        self.add_bias(out.index_axis_mut(Axis(0), 0));
        Zonotope::new(out.into_dyn())
    }
}

/// Rectified linear unit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ZonoReLU;

impl ZonoReLU {
    pub fn new() -> Self {
        Self
    }
}

impl ZonotopePropagation for ZonoReLU {
    fn concrete_forward(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        Ok(input.mapv(|v| v.max(0.0)))
    }

    /// DeepZ transformer, per dimension with `l, u = c ∓ Σ|e|`:
    ///
    /// - `l >= 0`: unchanged
    /// - `u <= 0`: center and error terms zeroed
    /// - otherwise, with `λ = u / (u - l)` and `μ = -λ·l / 2`, the dimension
    ///   becomes `λ·x + μ` and gains a fresh error term of size `μ`.
    ///
    /// Fresh terms are appended after the existing ones, one per crossing
    /// dimension in row-major order.
    fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope> {
        let value_shape = input.value_shape().to_vec();
        let flat = input.reshape_rows()?;
        let rows = flat
            .stacked()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| ZetaError::InvalidInput(format!("flattened zonotope is not 2-D: {}", e)))?;
        let (lower, upper) = flat.bounds();
        let lower = lower
            .into_dimensionality::<Ix1>()
            .map_err(|e| ZetaError::InvalidInput(format!("zonotope bounds are not 1-D: {}", e)))?;
        let upper = upper
            .into_dimensionality::<Ix1>()
            .map_err(|e| ZetaError::InvalidInput(format!("zonotope bounds are not 1-D: {}", e)))?;

        let existing = rows.nrows();
        let crossing = lower
            .iter()
            .zip(upper.iter())
            .filter(|&(&l, &u)| l < 0.0 && u > 0.0)
            .count();

        let mut out = Array2::<f32>::zeros((existing + crossing, rows.ncols()));
        out.slice_mut(s![..existing, ..]).assign(&rows);

        let mut fresh = existing;
        for (j, (&l, &u)) in lower.iter().zip(upper.iter()).enumerate() {
            if l >= 0.0 {
                continue;
            }
            if u <= 0.0 {
                out.column_mut(j).fill(0.0);
                continue;
            }
            let lambda = u / (u - l);
            let mu = -lambda * l / 2.0;
            out.slice_mut(s![..existing, j]).mapv_inplace(|v| v * lambda);
            out[[0, j]] += mu;
            out[[fresh, j]] = mu;
            fresh += 1;
        }
        trace!(
            "ReLU: {} of {} dimensions crossing zero",
            crossing,
            rows.ncols()
        );

        Zonotope::new(out.into_dyn())?.with_value_shape(&value_shape)
    }
}

/// The layers a network can be converted into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AbstractLayer {
    Conv2d(ZonoConv2d),
    Dense(ZonoDense),
    ReLU(ZonoReLU),
}

impl AbstractLayer {
    /// Convert a concrete layer description, copying its weights.
    pub fn from_spec(spec: &LayerSpec) -> Result<Self> {
        match &spec.layer_type {
            LayerType::Conv2d => convert_conv2d(spec),
            LayerType::Linear => convert_linear(spec),
            LayerType::ReLU => Ok(AbstractLayer::ReLU(ZonoReLU::new())),
            other => Err(ZetaError::UnsupportedLayer(format!(
                "{} ({}): supported operations are Conv2d, Linear and ReLU",
                spec.name, other
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AbstractLayer::Conv2d(_) => "ZonoConv2d",
            AbstractLayer::Dense(_) => "ZonoDense",
            AbstractLayer::ReLU(_) => "ZonoReLU",
        }
    }

    pub fn is_conv(&self) -> bool {
        matches!(self, AbstractLayer::Conv2d(_))
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, AbstractLayer::Dense(_))
    }

    pub fn is_relu(&self) -> bool {
        matches!(self, AbstractLayer::ReLU(_))
    }
}

impl ZonotopePropagation for AbstractLayer {
    fn concrete_forward(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        match self {
            AbstractLayer::Conv2d(l) => l.concrete_forward(input),
            AbstractLayer::Dense(l) => l.concrete_forward(input),
            AbstractLayer::ReLU(l) => l.concrete_forward(input),
        }
    }

    fn abstract_forward(&self, input: &Zonotope) -> Result<Zonotope> {
        match self {
            AbstractLayer::Conv2d(l) => l.abstract_forward(input),
            AbstractLayer::Dense(l) => l.abstract_forward(input),
            AbstractLayer::ReLU(l) => l.abstract_forward(input),
        }
    }
}

fn weight_of(spec: &LayerSpec) -> Result<&ArrayD<f32>> {
    spec.weight.as_ref().ok_or_else(|| {
        ZetaError::InvalidInput(format!("{} layer {} has no weight", spec.layer_type, spec.name))
    })
}

fn bias_of(spec: &LayerSpec) -> Result<Option<Array1<f32>>> {
    spec.bias
        .as_ref()
        .map(|b| {
            b.clone()
                .into_dimensionality::<Ix1>()
                .map_err(|_| ZetaError::InvalidInput(format!(
                    "layer {} bias must be 1-D, got shape {:?}",
                    spec.name,
                    b.shape()
                )))
        })
        .transpose()
}

fn convert_linear(spec: &LayerSpec) -> Result<AbstractLayer> {
    let weight = weight_of(spec)?;
    let weight = weight
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| ZetaError::shape_mismatch(vec![0, 0], weight.shape().to_vec()))?;
    debug!("Linear {}: weight {:?}", spec.name, weight.shape());
    Ok(AbstractLayer::Dense(ZonoDense::new(weight, bias_of(spec)?)?))
}

fn convert_conv2d(spec: &LayerSpec) -> Result<AbstractLayer> {
    let weight = weight_of(spec)?;
    let kernel = weight
        .clone()
        .into_dimensionality::<Ix4>()
        .map_err(|_| ZetaError::shape_mismatch(vec![0, 0, 0, 0], weight.shape().to_vec()))?;
    let stride = spec.attr_pair("strides", (1, 1))?;
    let padding = spec.attr_pair("pads", (0, 0))?;
    let dilation = spec.attr_pair("dilations", (1, 1))?;
    debug!(
        "Conv2d {}: kernel {:?}, stride {:?}, padding {:?}, dilation {:?}",
        spec.name,
        kernel.shape(),
        stride,
        padding,
        dilation
    );
    Ok(AbstractLayer::Conv2d(ZonoConv2d::new(
        kernel,
        bias_of(spec)?,
        stride,
        padding,
        dilation,
    )?))
}
