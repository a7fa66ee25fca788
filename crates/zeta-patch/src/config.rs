//! Configuration for adversarial patch generation.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use zeta_core::{Result, ZetaError};

/// How images are split into gradient batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchingMode {
    /// `floor(N / batch_size)` full batches; trailing images never contribute
    /// to the patch gradient.
    #[default]
    Legacy,
    /// Full batches plus one final partial batch, so every image contributes.
    Strict,
}

impl BatchingMode {
    /// Index ranges of the batches for `n` images.
    pub fn batch_ranges(&self, n: usize, batch_size: usize) -> Vec<Range<usize>> {
        let full = n / batch_size;
        let mut ranges: Vec<Range<usize>> = (0..full)
            .map(|b| b * batch_size..(b + 1) * batch_size)
            .collect();
        if *self == BatchingMode::Strict && full * batch_size < n {
            ranges.push(full * batch_size..n);
        }
        ranges
    }
}

/// Bounds for randomly sampled patch transforms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingRange {
    /// Rotation is drawn from `[-rotation_max, rotation_max]` degrees.
    pub rotation_max: f32,
    pub scale_min: f32,
    pub scale_max: f32,
}

/// Configuration for [`AdversarialPatch`](crate::AdversarialPatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Label the patch should push the classifier towards.
    pub target: usize,
    /// Maximum rotation in degrees, in `[0, 180]`.
    pub rotation_max: f32,
    /// Minimum scale, in `(0, scale_max]`.
    pub scale_min: f32,
    /// Maximum scale, at most 1.
    pub scale_max: f32,
    pub learning_rate: f32,
    /// Number of optimization iterations. There is no convergence check.
    pub max_iter: usize,
    pub batch_size: usize,
    pub batching: BatchingMode,
    /// Seed for the per-run random source.
    pub seed: u64,
    /// Transform images and map gradients back on the rayon pool.
    pub parallel: bool,
    /// Exponent controlling how sharp the circular mask edge is.
    pub mask_sharpness: i32,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            target: 0,
            rotation_max: 22.5,
            scale_min: 0.1,
            scale_max: 1.0,
            learning_rate: 5.0,
            max_iter: 500,
            batch_size: 16,
            batching: BatchingMode::Legacy,
            seed: 42,
            parallel: false,
            mask_sharpness: 40,
        }
    }
}

impl PatchConfig {
    /// Short runs for smoke tests and small models.
    pub fn fast() -> Self {
        Self {
            max_iter: 50,
            batch_size: 8,
            ..Self::default()
        }
    }

    pub fn sampling_range(&self) -> SamplingRange {
        SamplingRange {
            rotation_max: self.rotation_max,
            scale_min: self.scale_min,
            scale_max: self.scale_max,
        }
    }

    /// Reject non-finite or out-of-range parameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ZetaError::InvalidConfig(msg));

        if !self.rotation_max.is_finite() || !(0.0..=180.0).contains(&self.rotation_max) {
            return invalid(format!(
                "rotation_max must be between 0 and 180 degrees, got {}",
                self.rotation_max
            ));
        }
        if !self.scale_max.is_finite() || self.scale_max > 1.0 {
            return invalid(format!(
                "scale_max must not be greater than 1, got {}",
                self.scale_max
            ));
        }
        if !self.scale_min.is_finite() || self.scale_min <= 0.0 || self.scale_min > self.scale_max
        {
            return invalid(format!(
                "scale_min must be greater than 0 and at most scale_max ({}), got {}",
                self.scale_max, self.scale_min
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid(format!(
                "learning_rate must be greater than 0, got {}",
                self.learning_rate
            ));
        }
        if self.max_iter == 0 {
            return invalid("max_iter must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0".to_string());
        }
        if self.mask_sharpness <= 0 {
            return invalid(format!(
                "mask_sharpness must be positive, got {}",
                self.mask_sharpness
            ));
        }
        Ok(())
    }
}
