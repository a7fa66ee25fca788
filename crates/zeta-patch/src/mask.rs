//! Circular patch mask.

use ndarray::{s, Array2, Array3, Axis};
use zeta_core::{DataLayout, Result, ZetaError};

/// Soft-edged disc covering the patch, shaped like one image.
///
/// On a `d × d` grid (`d = min(h, w)`) with coordinates evenly spaced over
/// `[-1, 1]`, the value is `1 - clip((x² + y²)^sharpness, -1, 1)`. The disc is
/// zero-padded to `h × w` and repeated over every channel.
pub fn circular_mask(shape: &[usize], layout: DataLayout, sharpness: i32) -> Result<Array3<f32>> {
    if shape.len() != 3 {
        return Err(ZetaError::InvalidInput(format!(
            "circular mask needs a 3-D image shape, got {:?}",
            shape
        )));
    }
    let (h, w) = layout.spatial_dims(shape);
    let d = h.min(w);

    // Numerators are symmetric integers so that coord(d-1-i) == -coord(i) exactly.
    let coord = |i: usize| -> f64 {
        if d <= 1 {
            return -1.0;
        }
        let num = 2 * i as i64 - (d as i64 - 1);
        num as f64 / (d - 1) as f64
    };
    let disc = Array2::from_shape_fn((d, d), |(i, j)| {
        let (y, x) = (coord(i), coord(j));
        let z = (x * x + y * y).powi(sharpness).clamp(-1.0, 1.0);
        (1.0 - z) as f32
    });

    let top = (h - d) / 2;
    let left = (w - d) / 2;
    let mut plane = Array2::<f32>::zeros((h, w));
    plane.slice_mut(s![top..top + d, left..left + d]).assign(&disc);

    let axis = Axis(layout.channel_axis());
    let mut mask = Array3::zeros((shape[0], shape[1], shape[2]));
    for mut channel in mask.axis_iter_mut(axis) {
        channel.assign(&plane);
    }
    Ok(mask)
}
