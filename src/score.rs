//! Latitude-weighted forecast verification.
//!
//! Grid cells shrink towards the poles, so errors are weighted by the cosine
//! of latitude, normalized to mean 1 over the grid, before the root mean
//! square is taken.

use crate::data_io::container::load_variable;
use crate::data_io::writer::PredictionSet;
use chrono::{DateTime, Utc};
use log::warn;
use ndarray::{Array1, ArrayView3, Axis};
use std::collections::HashMap;
use std::path::Path;

/// Cosine-of-latitude weights normalized to mean 1.
pub fn lat_weights(lat: &Array1<f32>) -> Array1<f32> {
    let mut w = lat.mapv(|l| l.to_radians().cos());
    let mean = w.sum() / w.len() as f32;
    w.mapv_inplace(|v| v / mean);
    w
}

/// Root of the latitude-weighted mean squared error over all times and grid
/// points.
pub fn weighted_rmse(pred: ArrayView3<f32>, truth: ArrayView3<f32>, weights: &Array1<f32>) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0.0f64;
    for (pred_t, truth_t) in pred.outer_iter().zip(truth.outer_iter()) {
        for ((pred_row, truth_row), &w) in
            pred_t.outer_iter().zip(truth_t.outer_iter()).zip(weights)
        {
            for (&p, &t) in pred_row.iter().zip(truth_row.iter()) {
                let d = (p - t) as f64;
                sum += w as f64 * d * d;
                count += 1.0;
            }
        }
    }
    (sum / count).sqrt() as f32
}

/// One verified (variable, level) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub name: String,
    pub rmse: f32,
}

/// Verify predictions against the archived truth under `datadir`.
///
/// Truth is loaded per variable and aligned to the prediction times. A
/// variable whose archive is missing, or whose times do not cover the
/// forecasts, is skipped with a warning rather than failing the run.
pub fn score_predictions(datadir: &Path, preds: &PredictionSet) -> Vec<Score> {
    let weights = lat_weights(&preds.lat);
    let mut scores = Vec::new();

    for var in &preds.vars {
        let truth = match load_variable(datadir, &var.name) {
            Ok(truth) => truth,
            Err(err) => {
                warn!("no archived truth for '{}': {}", var.name, err);
                continue;
            }
        };
        let idxs = match align_times(&truth.time, &preds.time) {
            Some(idxs) => idxs,
            None => {
                warn!(
                    "archived '{}' does not cover the forecast times, skipping",
                    var.name
                );
                continue;
            }
        };
        let truth_data = truth.data.select(Axis(0), &idxs);

        for (slot, label) in slot_labels(var).into_iter().enumerate() {
            let truth_slot = match &var.levels {
                Some(levels) => match truth
                    .meta
                    .levels
                    .as_ref()
                    .and_then(|ls| ls.iter().position(|l| *l == levels[slot]))
                {
                    Some(li) => li,
                    None => {
                        warn!("archived '{}' lacks level {}, skipping", var.name, levels[slot]);
                        continue;
                    }
                },
                None => 0,
            };
            let rmse = weighted_rmse(
                var.data.index_axis(Axis(3), slot),
                truth_data.index_axis(Axis(3), truth_slot),
                &weights,
            );
            scores.push(Score { name: label, rmse });
        }
    }
    scores
}

fn slot_labels(var: &crate::data_io::writer::PredictedVar) -> Vec<String> {
    match &var.levels {
        Some(levels) => levels
            .iter()
            .map(|l| format!("{}_{}", var.name, l))
            .collect(),
        None => vec![var.name.clone()],
    }
}

/// Indices into `truth` matching each entry of `wanted`, or `None` if any
/// forecast time is absent from the archive.
fn align_times(truth: &[DateTime<Utc>], wanted: &[DateTime<Utc>]) -> Option<Vec<usize>> {
    let positions: HashMap<&DateTime<Utc>, usize> =
        truth.iter().enumerate().map(|(i, t)| (t, i)).collect();
    wanted.iter().map(|t| positions.get(t).copied()).collect()
}
