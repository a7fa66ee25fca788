//! DeepZ robustness certification.
//!
//! A sample is certified for class `p` when, over the whole output zonotope,
//! the logit of `p` stays strictly above every other logit. Each pairwise
//! check builds the zonotope of `logit[p] - logit[k]` by subtracting rows and
//! takes its interval lower bound. A failed check only means the relaxation
//! was too loose to prove robustness; it says nothing about whether the
//! sample is misclassified.

use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewD, Ix2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zeta_core::{argmax_rows, Result, ZetaError};

use crate::model::ConvertedModel;
use crate::zonotope::{stack_center, Zonotope};

/// Configuration for [`DeepZCertifier`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertifyConfig {
    /// Check the per-class margins on the rayon pool.
    pub parallel: bool,
}

/// Lower bound of `logit[predicted] - logit[class]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMargin {
    pub class: usize,
    pub lower_bound: f32,
}

impl ClassMargin {
    pub fn is_certified(&self) -> bool {
        self.lower_bound > 0.0
    }
}

/// Outcome of [`DeepZCertifier::certify_detailed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificationReport {
    pub certified: bool,
    pub predicted_class: usize,
    /// One entry per class other than `predicted_class`, in class order.
    pub margins: Vec<ClassMargin>,
}

impl CertificationReport {
    /// The margin closest to (or furthest below) zero.
    pub fn weakest(&self) -> Option<&ClassMargin> {
        self.margins
            .iter()
            .min_by(|a, b| a.lower_bound.total_cmp(&b.lower_bound))
    }
}

/// Certifies predictions of a [`ConvertedModel`] against zonotope-shaped
/// input regions.
#[derive(Debug, Clone)]
pub struct DeepZCertifier {
    model: ConvertedModel,
    nb_classes: usize,
    config: CertifyConfig,
}

impl DeepZCertifier {
    pub fn new(model: ConvertedModel, nb_classes: usize) -> Result<Self> {
        if nb_classes == 0 {
            return Err(ZetaError::InvalidConfig(
                "certifier needs at least one class".to_string(),
            ));
        }
        Ok(Self {
            model,
            nb_classes,
            config: CertifyConfig::default(),
        })
    }

    pub fn with_config(mut self, config: CertifyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(&self) -> &ConvertedModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ConvertedModel {
        &mut self.model
    }

    pub fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    /// Whether every point of the input zonotope keeps `predicted_class`.
    ///
    /// `center` is a batch of one (`[1, ...input_shape]`), `error_terms` is
    /// `[k, ...input_shape]`.
    pub fn certify(
        &self,
        center: ArrayViewD<'_, f32>,
        error_terms: ArrayViewD<'_, f32>,
        predicted_class: usize,
    ) -> Result<bool> {
        Ok(self
            .certify_detailed(center, error_terms, predicted_class)?
            .certified)
    }

    /// Like [`certify`](Self::certify), reporting every pairwise margin.
    pub fn certify_detailed(
        &self,
        center: ArrayViewD<'_, f32>,
        error_terms: ArrayViewD<'_, f32>,
        predicted_class: usize,
    ) -> Result<CertificationReport> {
        let input = stack_center(center, error_terms)?;
        self.certify_zonotope(&input, predicted_class)
    }

    /// Certify the L∞ ball of radius `eps` around one sample, against the
    /// class the model predicts for it.
    pub fn certify_linf(&self, sample: ArrayViewD<'_, f32>, eps: f32) -> Result<CertificationReport> {
        let predicted_class = self.model.predict_class(sample.view())?;
        let input = Zonotope::from_linf_ball(sample, eps)?;
        self.certify_zonotope(&input, predicted_class)
    }

    /// Certify an input zonotope over the model's input shape.
    pub fn certify_zonotope(
        &self,
        input: &Zonotope,
        predicted_class: usize,
    ) -> Result<CertificationReport> {
        if predicted_class >= self.nb_classes {
            return Err(ZetaError::InvalidInput(format!(
                "predicted class {} is out of range for {} classes",
                predicted_class, self.nb_classes
            )));
        }
        let output = self.model.abstract_forward(input)?;
        let logits = self.logit_rows(&output)?;

        let margin = |class: usize| ClassMargin {
            class,
            lower_bound: subtraction_lower_bound(logits, predicted_class, class),
        };
        let others = (0..self.nb_classes).filter(|&k| k != predicted_class);
        let margins: Vec<ClassMargin> = if self.config.parallel {
            others.collect::<Vec<_>>().into_par_iter().map(margin).collect()
        } else {
            others.map(margin).collect()
        };
        for m in &margins {
            trace!(
                "Class {} vs {}: lower bound {:.6}",
                predicted_class,
                m.class,
                m.lower_bound
            );
        }

        let certified = margins.iter().all(ClassMargin::is_certified);
        debug!(
            "Certification for class {}: {} ({} error terms at the output)",
            predicted_class,
            if certified { "certified" } else { "not certified" },
            output.num_error_terms()
        );
        Ok(CertificationReport {
            certified,
            predicted_class,
            margins,
        })
    }

    fn logit_rows<'a>(&self, output: &'a Zonotope) -> Result<ArrayView2<'a, f32>> {
        let rows = logit_view(output)?;
        if rows.ncols() != self.nb_classes {
            return Err(ZetaError::shape_mismatch(
                vec![self.nb_classes],
                vec![rows.ncols()],
            ));
        }
        Ok(rows)
    }
}

/// Lower bound of `logit[predicted] - logit[class]` over a stacked logit
/// zonotope `[1 + k, classes]`.
fn subtraction_lower_bound(logits: ArrayView2<'_, f32>, predicted: usize, class: usize) -> f32 {
    let diff: Array1<f32> = &logits.column(predicted) - &logits.column(class);
    lower_bound(diff.view())
}

/// `c - Σ|e|` for a stacked scalar zonotope.
fn lower_bound(stacked: ArrayView1<'_, f32>) -> f32 {
    let radius: f32 = stacked.iter().skip(1).map(|e| e.abs()).sum();
    stacked[0] - radius
}

/// Whether `logit[predicted] - logit[class]` is provably positive over the
/// output zonotope.
pub fn certify_via_subtraction(output: &Zonotope, predicted: usize, class: usize) -> Result<bool> {
    let logits = logit_view(output)?;
    for c in [predicted, class] {
        if c >= logits.ncols() {
            return Err(ZetaError::InvalidInput(format!(
                "class {} is out of range for {} logits",
                c,
                logits.ncols()
            )));
        }
    }
    Ok(subtraction_lower_bound(logits, predicted, class) > 0.0)
}

/// Largest upper bound of `logit[i] - logit[target]` over classes `i != target`.
///
/// This is the loss minimized when training for certifiability: once it is
/// negative, the target class is certified.
pub fn max_logit_loss(output: &Zonotope, target: usize) -> Result<f32> {
    let logits = logit_view(output)?;
    let classes = logits.ncols();
    if target >= classes || classes < 2 {
        return Err(ZetaError::InvalidInput(format!(
            "target {} needs at least one other class among {} logits",
            target, classes
        )));
    }
    let target_col = logits.column(target);
    let worst = (0..classes)
        .filter(|&i| i != target)
        .map(|i| {
            let diff: Array1<f32> = &logits.column(i) - &target_col;
            let radius: f32 = diff.iter().skip(1).map(|e| e.abs()).sum();
            diff[0] + radius
        })
        .fold(f32::NEG_INFINITY, f32::max);
    Ok(worst)
}

/// Fraction of rows of `predictions` whose argmax equals the label.
pub fn accuracy(predictions: ArrayView2<'_, f32>, labels: &[usize]) -> Result<f32> {
    if predictions.nrows() != labels.len() {
        return Err(ZetaError::shape_mismatch(
            vec![labels.len(), predictions.ncols()],
            predictions.shape().to_vec(),
        ));
    }
    if labels.is_empty() {
        return Err(ZetaError::InvalidInput(
            "accuracy of an empty batch is undefined".to_string(),
        ));
    }
    let predicted = argmax_rows(&predictions.to_owned());
    let correct = predicted
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    Ok(correct as f32 / labels.len() as f32)
}

fn logit_view(output: &Zonotope) -> Result<ArrayView2<'_, f32>> {
    output
        .stacked()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            ZetaError::InvalidInput(format!(
                "expected a zonotope over a logit vector, got value shape {:?}",
                output.value_shape()
            ))
        })
}
