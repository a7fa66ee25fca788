//! Rotation, scaling and translation of patch-shaped images.
//!
//! Every operation works channel plane by channel plane, samples with
//! first-order (bilinear) interpolation and fills with zeros outside the
//! source. Using the same interpolation order forwards and backwards keeps
//! `invert(apply(x, r), r)` close to `x` on the region the transform keeps.
//!
//! Forward order is rotate → scale → shift; [`TransformEngine::invert`] runs
//! shift⁻¹ → scale⁻¹ → rotate⁻¹. Mixing up the inverse order biases the
//! gradients mapped back into patch space.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use zeta_core::{DataLayout, Result, ZetaError};

/// Parameters of one sampled patch transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    /// Rotation in degrees.
    pub angle: f32,
    pub scale: f32,
    /// Vertical offset in pixels.
    pub shift_h: f32,
    /// Horizontal offset in pixels.
    pub shift_w: f32,
}

impl TransformRecord {
    pub fn identity() -> Self {
        Self {
            angle: 0.0,
            scale: 1.0,
            shift_h: 0.0,
            shift_w: 0.0,
        }
    }
}

/// Applies and inverts geometric transforms on 3-D images of a given layout.
#[derive(Debug, Clone, Copy)]
pub struct TransformEngine {
    layout: DataLayout,
}

impl TransformEngine {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    /// Rotate about the plane center by `angle` degrees, keeping the shape.
    pub fn rotate(&self, x: ArrayView3<'_, f32>, angle: f32) -> Result<Array3<f32>> {
        check_finite("rotation angle", angle)?;
        if angle == 0.0 {
            return Ok(x.to_owned());
        }
        let (sin, cos) = angle.to_radians().sin_cos();
        Ok(self.map_planes(x, |plane| {
            let (h, w) = plane.dim();
            let cy = (h as f32 - 1.0) / 2.0;
            let cx = (w as f32 - 1.0) / 2.0;
            Array2::from_shape_fn((h, w), |(i, j)| {
                let dy = i as f32 - cy;
                let dx = j as f32 - cx;
                let sy = cy + cos * dy + sin * dx;
                let sx = cx - sin * dy + cos * dx;
                sample_bilinear(&plane, sy, sx)
            })
        }))
    }

    /// Zoom by `factor` about the plane center, keeping the shape.
    ///
    /// Below 1 the zoomed image is pasted into the middle of a zero image;
    /// above 1 the central `1/factor` window is enlarged to the full size.
    /// Both regions are at least one pixel wide.
    pub fn scale(&self, x: ArrayView3<'_, f32>, factor: f32) -> Result<Array3<f32>> {
        check_scale(factor)?;
        if factor == 1.0 {
            return Ok(x.to_owned());
        }
        let window = ScaleWindow::new(self.layout.spatial_dims(x.shape()), factor);
        if factor < 1.0 {
            Ok(self.map_planes(x, |plane| window.paste(plane)))
        } else {
            Ok(self.map_planes(x, |plane| window.crop(plane)))
        }
    }

    /// Translate by `(dh, dw)` pixels: `out[i, j] = x[i - dh, j - dw]`.
    pub fn shift(&self, x: ArrayView3<'_, f32>, dh: f32, dw: f32) -> Result<Array3<f32>> {
        check_finite("vertical shift", dh)?;
        check_finite("horizontal shift", dw)?;
        if dh == 0.0 && dw == 0.0 {
            return Ok(x.to_owned());
        }
        Ok(self.map_planes(x, |plane| {
            Array2::from_shape_fn(plane.dim(), |(i, j)| {
                sample_bilinear(&plane, i as f32 - dh, j as f32 - dw)
            })
        }))
    }

    pub fn invert_rotate(&self, x: ArrayView3<'_, f32>, angle: f32) -> Result<Array3<f32>> {
        self.rotate(x, -angle)
    }

    /// Undo [`scale`](Self::scale) on the window the forward pass used:
    /// a shrunk image is cropped back out and enlarged, an enlarged one is
    /// shrunk back into its crop window with zeros around it.
    pub fn invert_scale(&self, x: ArrayView3<'_, f32>, factor: f32) -> Result<Array3<f32>> {
        check_scale(factor)?;
        if factor == 1.0 {
            return Ok(x.to_owned());
        }
        let window = ScaleWindow::new(self.layout.spatial_dims(x.shape()), factor);
        if factor < 1.0 {
            Ok(self.map_planes(x, |plane| window.crop(plane)))
        } else {
            Ok(self.map_planes(x, |plane| window.paste(plane)))
        }
    }

    pub fn invert_shift(&self, x: ArrayView3<'_, f32>, dh: f32, dw: f32) -> Result<Array3<f32>> {
        self.shift(x, -dh, -dw)
    }

    /// Rotate, then scale, then shift.
    pub fn apply(&self, x: ArrayView3<'_, f32>, record: &TransformRecord) -> Result<Array3<f32>> {
        let rotated = self.rotate(x, record.angle)?;
        let scaled = self.scale(rotated.view(), record.scale)?;
        self.shift(scaled.view(), record.shift_h, record.shift_w)
    }

    /// Undo [`apply`](Self::apply): unshift, then unscale, then unrotate.
    pub fn invert(&self, x: ArrayView3<'_, f32>, record: &TransformRecord) -> Result<Array3<f32>> {
        let unshifted = self.invert_shift(x, record.shift_h, record.shift_w)?;
        let unscaled = self.invert_scale(unshifted.view(), record.scale)?;
        self.invert_rotate(unscaled.view(), record.angle)
    }

    fn map_planes<F>(&self, x: ArrayView3<'_, f32>, f: F) -> Array3<f32>
    where
        F: Fn(ArrayView2<'_, f32>) -> Array2<f32>,
    {
        let axis = Axis(self.layout.channel_axis());
        let mut out = Array3::zeros(x.raw_dim());
        for (src, mut dst) in x.axis_iter(axis).zip(out.axis_iter_mut(axis)) {
            dst.assign(&f(src));
        }
        out
    }
}

fn check_finite(what: &str, value: f32) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ZetaError::InvalidConfig(format!(
            "{} must be finite, got {}",
            what, value
        )))
    }
}

fn check_scale(factor: f32) -> Result<()> {
    check_finite("scale factor", factor)?;
    if factor <= 0.0 {
        return Err(ZetaError::InvalidConfig(format!(
            "scale factor must be positive, got {}",
            factor
        )));
    }
    Ok(())
}

/// The centered sub-window a scale touches: the paste target when
/// shrinking, the crop source when enlarging. The inverse reuses the same
/// window so both directions agree on size and offset.
#[derive(Debug, Clone, Copy)]
struct ScaleWindow {
    frame: (usize, usize),
    top: usize,
    left: usize,
    size: (usize, usize),
}

impl ScaleWindow {
    fn new((h, w): (usize, usize), factor: f32) -> Self {
        let (sh, sw) = if factor < 1.0 {
            (region(h as f32 * factor, h), region(w as f32 * factor, w))
        } else {
            (region(h as f32 / factor, h), region(w as f32 / factor, w))
        };
        // an empty frame has an empty window
        let size = (sh.min(h), sw.min(w));
        Self {
            frame: (h, w),
            top: (h - size.0) / 2,
            left: (w - size.1) / 2,
            size,
        }
    }

    /// Resize the whole plane into the window of a zero frame.
    fn paste(&self, plane: ArrayView2<'_, f32>) -> Array2<f32> {
        let (sh, sw) = self.size;
        let mut out = Array2::zeros(self.frame);
        out.slice_mut(s![self.top..self.top + sh, self.left..self.left + sw])
            .assign(&resize_bilinear(plane, sh, sw));
        out
    }

    /// Resize the window's content up to the whole frame.
    fn crop(&self, plane: ArrayView2<'_, f32>) -> Array2<f32> {
        let (sh, sw) = self.size;
        let crop = plane.slice(s![self.top..self.top + sh, self.left..self.left + sw]);
        resize_bilinear(crop, self.frame.0, self.frame.1)
    }
}

/// Rounded region size, floored at one pixel and capped at `limit`.
fn region(size: f32, limit: usize) -> usize {
    (size.round() as usize).clamp(1, limit.max(1))
}

/// Bilinear sample at a fractional position; out-of-range neighbours read as 0.
fn sample_bilinear(plane: &ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    let (h, w) = plane.dim();
    let (y0, x0) = (y.floor(), x.floor());
    let (fy, fx) = (y - y0, x - x0);
    let (y0, x0) = (y0 as isize, x0 as isize);
    let at = |yy: isize, xx: isize| -> f32 {
        if yy >= 0 && xx >= 0 && (yy as usize) < h && (xx as usize) < w {
            plane[[yy as usize, xx as usize]]
        } else {
            0.0
        }
    };
    let top = at(y0, x0) * (1.0 - fx) + at(y0, x0 + 1) * fx;
    let bottom = at(y0 + 1, x0) * (1.0 - fx) + at(y0 + 1, x0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resize with corner-aligned sampling: output index `o` reads input
/// coordinate `o * (n_in - 1) / (n_out - 1)`.
fn resize_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }
    let coord = |o: usize, n_in: usize, n_out: usize| -> f32 {
        let last = (n_in - 1) as f32;
        if n_out <= 1 {
            return last / 2.0;
        }
        ((o * (n_in - 1)) as f32 / (n_out - 1) as f32).clamp(0.0, last)
    };
    Array2::from_shape_fn((out_h, out_w), |(i, j)| {
        sample_bilinear(&src, coord(i, in_h, out_h), coord(j, in_w, out_w))
    })
}
