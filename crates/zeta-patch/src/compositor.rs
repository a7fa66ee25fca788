//! Placing randomly transformed patches onto images.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use rand::Rng;
use rayon::prelude::*;
use tracing::trace;
use zeta_core::{DataLayout, Result, ZetaError};

use crate::config::SamplingRange;
use crate::mask::circular_mask;
use crate::transform::{TransformEngine, TransformRecord};

/// A patch and its mask after one sampled transform.
#[derive(Debug, Clone)]
pub struct TransformedPatch {
    pub patch: Array3<f32>,
    pub mask: Array3<f32>,
    pub record: TransformRecord,
}

/// A batch of patched images with the per-image masks and transforms that
/// produced them.
#[derive(Debug, Clone)]
pub struct AugmentedBatch {
    pub images: Array4<f32>,
    pub masks: Array4<f32>,
    pub records: Vec<TransformRecord>,
}

/// Composites a patch onto images of a fixed shape.
#[derive(Debug, Clone)]
pub struct PatchCompositor {
    engine: TransformEngine,
    image_shape: Vec<usize>,
    patch_shape: Vec<usize>,
    mask: Array3<f32>,
}

impl PatchCompositor {
    /// The patch covers the whole image frame, so patch and image shapes agree.
    pub fn new(image_shape: &[usize], layout: DataLayout, mask_sharpness: i32) -> Result<Self> {
        let mask = circular_mask(image_shape, layout, mask_sharpness)?;
        Ok(Self {
            engine: TransformEngine::new(layout),
            image_shape: image_shape.to_vec(),
            patch_shape: image_shape.to_vec(),
            mask,
        })
    }

    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }

    /// The untransformed circular mask.
    pub fn mask(&self) -> &Array3<f32> {
        &self.mask
    }

    pub fn patch_shape(&self) -> &[usize] {
        &self.patch_shape
    }

    /// `image * (1 - mask) + patch * mask`.
    ///
    /// Mask values must lie in `[0, 1]`.
    pub fn apply(
        &self,
        image: ArrayView3<'_, f32>,
        patch: ArrayView3<'_, f32>,
        mask: ArrayView3<'_, f32>,
    ) -> Result<Array3<f32>> {
        for other in [patch.shape(), mask.shape()] {
            if other != image.shape() {
                return Err(ZetaError::shape_mismatch(
                    image.shape().to_vec(),
                    other.to_vec(),
                ));
            }
        }
        debug_assert!(
            mask.iter().all(|&m| (0.0..=1.0).contains(&m)),
            "mask values must lie in [0, 1]"
        );
        Ok(Zip::from(&image)
            .and(&patch)
            .and(&mask)
            .map_collect(|&x, &p, &m| x * (1.0 - m) + p * m))
    }

    /// Draw transform parameters.
    ///
    /// The shift range keeps the scaled patch inside the image; when the patch
    /// already fills the frame along either axis the shift is `(0, 0)`.
    pub fn sample_record<R: Rng>(
        &self,
        rng: &mut R,
        range: &SamplingRange,
        scale_override: Option<f32>,
    ) -> TransformRecord {
        let layout = self.engine.layout();
        let angle = uniform(rng, -range.rotation_max, range.rotation_max);
        let scale = match scale_override {
            Some(scale) => scale,
            None => uniform(rng, range.scale_min, range.scale_max),
        };

        let (image_h, image_w) = layout.spatial_dims(&self.image_shape);
        let (patch_h, patch_w) = layout.spatial_dims(&self.patch_shape);
        let shift_max_h = (image_h as f32 - patch_h as f32 * scale) / 2.0;
        let shift_max_w = (image_w as f32 - patch_w as f32 * scale) / 2.0;
        let (shift_h, shift_w) = if shift_max_h > 0.0 && shift_max_w > 0.0 {
            (
                uniform(rng, -shift_max_h, shift_max_h),
                uniform(rng, -shift_max_w, shift_max_w),
            )
        } else {
            (0.0, 0.0)
        };

        TransformRecord {
            angle,
            scale,
            shift_h,
            shift_w,
        }
    }

    /// Apply a known transform to a patch and to the circular mask.
    pub fn transform(
        &self,
        patch: ArrayView3<'_, f32>,
        record: TransformRecord,
    ) -> Result<TransformedPatch> {
        if patch.shape() != self.patch_shape.as_slice() {
            return Err(ZetaError::shape_mismatch(
                self.patch_shape.clone(),
                patch.shape().to_vec(),
            ));
        }
        // Interpolation can overshoot 1 by an ulp.
        let mask = self
            .engine
            .apply(self.mask.view(), &record)?
            .mapv_into(|m| m.clamp(0.0, 1.0));
        Ok(TransformedPatch {
            patch: self.engine.apply(patch, &record)?,
            mask,
            record,
        })
    }

    /// Sample a transform and apply it to the patch and its mask.
    pub fn sample_transform<R: Rng>(
        &self,
        patch: ArrayView3<'_, f32>,
        rng: &mut R,
        range: &SamplingRange,
        scale_override: Option<f32>,
    ) -> Result<TransformedPatch> {
        let record = self.sample_record(rng, range, scale_override);
        self.transform(patch, record)
    }

    /// Paste an independently transformed copy of `patch` onto every image.
    ///
    /// Transforms are drawn from `rng` in image order before any work is
    /// done, so the result does not depend on `parallel`.
    pub fn augment_batch<R: Rng>(
        &self,
        images: ArrayView4<'_, f32>,
        patch: ArrayView3<'_, f32>,
        rng: &mut R,
        range: &SamplingRange,
        scale_override: Option<f32>,
        parallel: bool,
    ) -> Result<AugmentedBatch> {
        let n = images.len_of(Axis(0));
        let records: Vec<TransformRecord> = (0..n)
            .map(|_| self.sample_record(rng, range, scale_override))
            .collect();

        let work = |i: usize| -> Result<(Array3<f32>, Array3<f32>)> {
            let transformed = self.transform(patch, records[i])?;
            let image = images.index_axis(Axis(0), i);
            let patched = self.apply(image, transformed.patch.view(), transformed.mask.view())?;
            Ok((patched, transformed.mask))
        };
        let results: Vec<Result<(Array3<f32>, Array3<f32>)>> = if parallel {
            (0..n).into_par_iter().map(work).collect()
        } else {
            (0..n).map(work).collect()
        };

        let mut patched_images = Array4::zeros(images.raw_dim());
        let mut masks = Array4::zeros(images.raw_dim());
        for (i, result) in results.into_iter().enumerate() {
            let (patched, mask) = result?;
            patched_images.index_axis_mut(Axis(0), i).assign(&patched);
            masks.index_axis_mut(Axis(0), i).assign(&mask);
        }
        trace!("Augmented {} images with random patch transforms", n);

        Ok(AugmentedBatch {
            images: patched_images,
            masks,
            records,
        })
    }

    /// Map an image-space gradient back into patch space.
    ///
    /// The gradient is restricted to the transformed mask, then unshifted,
    /// unscaled and unrotated.
    pub fn reverse_gradient(
        &self,
        gradient: ArrayView3<'_, f32>,
        mask: ArrayView3<'_, f32>,
        record: &TransformRecord,
    ) -> Result<Array3<f32>> {
        if gradient.shape() != mask.shape() {
            return Err(ZetaError::shape_mismatch(
                mask.shape().to_vec(),
                gradient.shape().to_vec(),
            ));
        }
        let masked = &gradient * &mask;
        self.engine.invert(masked.view(), record)
    }
}

/// Uniform draw from `[low, high]`; a degenerate range yields `low`.
fn uniform<R: Rng>(rng: &mut R, low: f32, high: f32) -> f32 {
    if high > low {
        rng.random_range(low..=high)
    } else {
        low
    }
}
