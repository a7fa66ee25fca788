//! Label helpers.

use ndarray::Array2;

use crate::{Result, ZetaError};

/// Convert class indices into a one-hot `(labels.len(), nb_classes)` matrix.
pub fn to_categorical(labels: &[usize], nb_classes: usize) -> Result<Array2<f32>> {
    let mut out = Array2::zeros((labels.len(), nb_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= nb_classes {
            return Err(ZetaError::InvalidInput(format!(
                "label {} at row {} is out of range for {} classes",
                label, row, nb_classes
            )));
        }
        out[[row, label]] = 1.0;
    }
    Ok(out)
}

/// Index of the largest value in each row. Ties resolve to the lowest index.
pub fn argmax_rows(values: &Array2<f32>) -> Vec<usize> {
    values
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
                    if v > best_v {
                        (i, v)
                    } else {
                        (best, best_v)
                    }
                })
                .0
        })
        .collect()
}
