//! Iterative optimization of an adversarial patch.
//!
//! Each iteration pastes a randomly rotated, scaled and shifted copy of the
//! patch onto every training image, asks the classifier for the loss
//! gradient with respect to the patched images, maps each gradient back into
//! patch space and takes a descent step.
//!
//! Reference: Brown et al. (2017), "Adversarial Patch".

use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, ArrayView4, Axis, Ix4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use zeta_core::{to_categorical, Bound, Classifier, DataLayout, Result, ZetaError};

use crate::compositor::PatchCompositor;
use crate::config::PatchConfig;

/// Progress of an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerState {
    /// `iteration` steps have completed.
    Running { iteration: usize },
    /// `max_iter` steps have completed.
    Done,
}

/// Output of [`AdversarialPatch::generate`].
#[derive(Debug, Clone)]
pub struct PatchResult {
    pub patch: Array3<f32>,
    /// Untransformed circular mask for `patch`.
    pub mask: Array3<f32>,
    pub iterations: usize,
    /// Calls made to [`Classifier::loss_gradient`] during the run.
    pub gradient_queries: usize,
}

/// Adversarial patch optimizer.
///
/// Owns the patch and the random source; the patch is only mutated by
/// [`step`](Self::step).
pub struct AdversarialPatch {
    config: PatchConfig,
    compositor: PatchCompositor,
    image_shape: Vec<usize>,
    clip: Bound,
    nb_classes: usize,
    patch: Array3<f32>,
    rng: StdRng,
    state: OptimizerState,
    gradient_queries: usize,
}

impl AdversarialPatch {
    /// Create an optimizer for `classifier`, seeding the random source from
    /// `config.seed`.
    pub fn new<C: Classifier + ?Sized>(config: PatchConfig, classifier: &C) -> Result<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(config, classifier, rng)
    }

    /// Create an optimizer that draws transforms from `rng`.
    pub fn with_rng<C: Classifier + ?Sized>(
        config: PatchConfig,
        classifier: &C,
        rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;

        let image_shape = classifier.input_shape().to_vec();
        if image_shape.len() != 3 {
            return Err(ZetaError::InvalidInput(format!(
                "adversarial patches need images with spatial dimensions, classifier input shape is {:?}",
                image_shape
            )));
        }
        let nb_classes = classifier.nb_classes();
        if config.target >= nb_classes {
            return Err(ZetaError::InvalidConfig(format!(
                "target {} is out of range for {} classes",
                config.target, nb_classes
            )));
        }
        let clip = classifier.clip_values();
        if !clip.lower.is_finite() || !clip.upper.is_finite() || clip.lower > clip.upper {
            return Err(ZetaError::InvalidConfig(format!(
                "clip values must be finite with min <= max, got [{}, {}]",
                clip.lower, clip.upper
            )));
        }

        let layout = DataLayout::from_channels_first(classifier.channels_first());
        let compositor = PatchCompositor::new(&image_shape, layout, config.mask_sharpness)?;
        let patch = Array3::from_elem(
            (image_shape[0], image_shape[1], image_shape[2]),
            clip.midpoint(),
        );

        Ok(Self {
            config,
            compositor,
            image_shape,
            clip,
            nb_classes,
            patch,
            rng,
            state: OptimizerState::Running { iteration: 0 },
            gradient_queries: 0,
        })
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn patch(&self) -> ArrayView3<'_, f32> {
        self.patch.view()
    }

    /// Untransformed circular mask of the patch.
    pub fn mask(&self) -> Array3<f32> {
        self.compositor.mask().clone()
    }

    pub fn into_patch(self) -> Array3<f32> {
        self.patch
    }

    /// Optimize the patch over `images` for `max_iter` iterations.
    ///
    /// `images` must be `N × input_shape`. `targets` is a per-image label
    /// distribution (`N × nb_classes`); without it every image targets
    /// `config.target`. The patch carries over from earlier runs.
    pub fn generate<C: Classifier + ?Sized>(
        &mut self,
        classifier: &C,
        images: &ArrayD<f32>,
        targets: Option<ArrayView2<'_, f32>>,
    ) -> Result<PatchResult> {
        let images = self.check_images(images)?;
        let n = images.len_of(Axis(0));
        let targets: Array2<f32> = match targets {
            Some(t) => t.to_owned(),
            None => to_categorical(&vec![self.config.target; n], self.nb_classes)?,
        };

        info!(
            "Creating adversarial patch: {} images, {} iterations, target {}",
            n, self.config.max_iter, self.config.target
        );
        self.state = OptimizerState::Running { iteration: 0 };
        let queries_before = self.gradient_queries;

        while self.step(classifier, images, targets.view())? != OptimizerState::Done {}

        let gradient_queries = self.gradient_queries - queries_before;
        info!(
            "Adversarial patch finished after {} iterations ({} gradient queries)",
            self.config.max_iter, gradient_queries
        );
        Ok(PatchResult {
            patch: self.patch.clone(),
            mask: self.mask(),
            iterations: self.config.max_iter,
            gradient_queries,
        })
    }

    /// Run one optimization iteration and return the new state.
    ///
    /// On a finished optimizer this does nothing and returns `Done`.
    pub fn step<C: Classifier + ?Sized>(
        &mut self,
        classifier: &C,
        images: ArrayView4<'_, f32>,
        targets: ArrayView2<'_, f32>,
    ) -> Result<OptimizerState> {
        let iteration = match self.state {
            OptimizerState::Done => return Ok(OptimizerState::Done),
            OptimizerState::Running { iteration } => iteration,
        };
        self.check_batch(images, targets)?;

        let n = images.len_of(Axis(0));
        let range = self.config.sampling_range();
        let augmented = self.compositor.augment_batch(
            images,
            self.patch.view(),
            &mut self.rng,
            &range,
            None,
            self.config.parallel,
        )?;

        let batches = self.config.batching.batch_ranges(n, self.config.batch_size);
        let covered: usize = batches.iter().map(|r| r.len()).sum();
        if iteration == 0 && covered < n {
            warn!(
                "Batch size {} leaves {} of {} images out of every gradient step",
                self.config.batch_size,
                n - covered,
                n
            );
        }

        let mut patch_gradients = Array3::<f32>::zeros(self.patch.raw_dim());
        for batch in batches {
            let gradients = classifier.loss_gradient(
                augmented.images.slice(s![batch.clone(), .., .., ..]),
                targets.slice(s![batch.clone(), ..]),
            )?;
            self.gradient_queries += 1;

            let mut expected = vec![batch.len()];
            expected.extend_from_slice(&self.image_shape);
            if gradients.shape() != expected.as_slice() {
                return Err(ZetaError::shape_mismatch(expected, gradients.shape().to_vec()));
            }
            trace!("Gradient query for images {:?}", batch);

            let reverse = |offset: usize| -> Result<Array3<f32>> {
                let i = batch.start + offset;
                self.compositor.reverse_gradient(
                    gradients.index_axis(Axis(0), offset),
                    augmented.masks.index_axis(Axis(0), i),
                    &augmented.records[i],
                )
            };
            let contributions: Vec<Result<Array3<f32>>> = if self.config.parallel {
                (0..batch.len()).into_par_iter().map(reverse).collect()
            } else {
                (0..batch.len()).map(reverse).collect()
            };
            // Summed in image order so parallel and sequential runs agree bit for bit.
            for contribution in contributions {
                patch_gradients += &contribution?;
            }
        }

        self.patch
            .scaled_add(-self.config.learning_rate, &patch_gradients);
        let clip = self.clip;
        self.patch.mapv_inplace(|v| clip.clamp(v));

        let completed = iteration + 1;
        self.state = if completed >= self.config.max_iter {
            OptimizerState::Done
        } else {
            OptimizerState::Running {
                iteration: completed,
            }
        };
        debug!(
            "Patch iteration {}/{} done, gradient norm {:.6}",
            completed,
            self.config.max_iter,
            patch_gradients.iter().map(|g| g * g).sum::<f32>().sqrt()
        );
        Ok(self.state)
    }

    /// Paste the patch onto `images` once, at a fixed `scale`.
    ///
    /// Rotation and shift are still sampled at random; only the scale is
    /// pinned. `external_patch` replaces the optimized patch for this call.
    pub fn apply_patch(
        &mut self,
        images: &ArrayD<f32>,
        scale: f32,
        external_patch: Option<ArrayView3<'_, f32>>,
    ) -> Result<Array4<f32>> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ZetaError::InvalidConfig(format!(
                "patch scale must be finite and positive, got {}",
                scale
            )));
        }
        let images = self.check_images(images)?;
        let patch = match external_patch {
            Some(p) => p.reborrow(),
            None => self.patch.view(),
        };
        let range = self.config.sampling_range();
        let augmented = self.compositor.augment_batch(
            images,
            patch,
            &mut self.rng,
            &range,
            Some(scale),
            self.config.parallel,
        )?;
        Ok(augmented.images)
    }

    fn check_images<'a>(&self, images: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>> {
        if images.ndim() == 2 {
            return Err(ZetaError::InvalidInput(
                "feature vectors detected; adversarial patches need data with spatial dimensions"
                    .to_string(),
            ));
        }
        let view = images.view().into_dimensionality::<Ix4>().map_err(|_| {
            ZetaError::InvalidInput(format!(
                "expected a batch of 3-D images, got shape {:?}",
                images.shape()
            ))
        })?;
        if view.shape()[1..] != self.image_shape[..] {
            return Err(ZetaError::shape_mismatch(
                self.image_shape.clone(),
                view.shape()[1..].to_vec(),
            ));
        }
        Ok(view)
    }

    fn check_batch(&self, images: ArrayView4<'_, f32>, targets: ArrayView2<'_, f32>) -> Result<()> {
        if images.shape()[1..] != self.image_shape[..] {
            return Err(ZetaError::shape_mismatch(
                self.image_shape.clone(),
                images.shape()[1..].to_vec(),
            ));
        }
        let expected = vec![images.len_of(Axis(0)), self.nb_classes];
        if targets.shape() != expected.as_slice() {
            return Err(ZetaError::shape_mismatch(expected, targets.shape().to_vec()));
        }
        Ok(())
    }
}
