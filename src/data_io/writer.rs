//! Prediction output files.
//!
//! The network emits one flat slot axis; this module splits it back into
//! named variables with level labels and persists the result as an `.npz`
//! archive plus a JSON sidecar, mirroring the container layout.

use super::container::ContainerMeta;
use super::{datetime_to_hours, hours_to_datetime, DataError};
use chrono::{DateTime, Utc};
use ndarray::{s, Array1, Array4, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// One predicted variable with its level slots re-grouped.
#[derive(Debug)]
pub struct PredictedVar {
    pub name: String,
    pub levels: Option<Vec<i32>>,
    /// (time, lat, lon, level)
    pub data: Array4<f32>,
}

/// A full set of forecasts on the verification times.
#[derive(Debug)]
pub struct PredictionSet {
    pub time: Vec<DateTime<Utc>>,
    pub lat: Array1<f32>,
    pub lon: Array1<f32>,
    pub vars: Vec<PredictedVar>,
}

#[derive(Serialize, Deserialize)]
struct PredictionMeta {
    vars: Vec<ContainerMeta>,
}

/// Split a slot name like `z_500` into variable and level. Names without a
/// numeric `_level` suffix are single-level variables.
fn split_slot_name(name: &str) -> (String, Option<i32>) {
    match name.rsplit_once('_') {
        Some((var, level)) => match level.parse::<i32>() {
            Ok(l) => (var.to_string(), Some(l)),
            Err(_) => (name.to_string(), None),
        },
        None => (name.to_string(), None),
    }
}

/// Re-group a (time, lat, lon, slot) prediction array into per-variable
/// fields. Consecutive slots of the same variable become its level axis, in
/// slot order.
pub fn split_predictions(
    data: &Array4<f32>,
    slot_names: &[String],
    time: &[DateTime<Utc>],
    lat: &Array1<f32>,
    lon: &Array1<f32>,
) -> PredictionSet {
    let mut vars: Vec<PredictedVar> = Vec::new();
    let mut run: Vec<(usize, Option<i32>)> = Vec::new();
    let mut run_var: Option<String> = None;

    let mut flush = |vars: &mut Vec<PredictedVar>, var: &str, run: &[(usize, Option<i32>)]| {
        let idxs: Vec<usize> = run.iter().map(|(i, _)| *i).collect();
        let levels: Option<Vec<i32>> = run.iter().map(|(_, l)| *l).collect();
        vars.push(PredictedVar {
            name: var.to_string(),
            levels,
            data: data.select(Axis(3), &idxs),
        });
    };

    for (slot, name) in slot_names.iter().enumerate() {
        let (var, level) = split_slot_name(name);
        if run_var.as_deref() != Some(var.as_str()) {
            if let Some(prev) = run_var.take() {
                flush(&mut vars, &prev, &run);
                run.clear();
            }
            run_var = Some(var);
        }
        run.push((slot, level));
    }
    if let Some(prev) = run_var {
        flush(&mut vars, &prev, &run);
    }

    PredictionSet {
        time: time.to_vec(),
        lat: lat.clone(),
        lon: lon.clone(),
        vars,
    }
}

/// Write a prediction set to `path` (`.npz`) with a JSON sidecar listing the
/// variables and their levels.
pub fn write_predictions(path: &Path, preds: &PredictionSet) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let hours: Array1<f64> = preds.time.iter().map(datetime_to_hours).collect();

    let mut npz = NpzWriter::new(File::create(path)?);
    npz.add_array("time", &hours)?;
    npz.add_array("lat", &preds.lat)?;
    npz.add_array("lon", &preds.lon)?;
    for var in &preds.vars {
        npz.add_array(var.name.clone(), &var.data)?;
    }
    npz.finish()?;

    let meta = PredictionMeta {
        vars: preds
            .vars
            .iter()
            .map(|v| ContainerMeta {
                var: v.name.clone(),
                levels: v.levels.clone(),
                constant: false,
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&meta)?;
    std::fs::write(path.with_extension("json"), json)?;
    Ok(())
}

/// Read back a prediction file written by [`write_predictions`].
pub fn read_predictions(path: &Path) -> Result<PredictionSet, DataError> {
    let json = std::fs::read_to_string(path.with_extension("json"))?;
    let meta: PredictionMeta = serde_json::from_str(&json)?;

    let mut npz = NpzReader::new(File::open(path)?)?;
    let hours: Array1<f64> = npz.by_name("time")?;
    let lat: Array1<f32> = npz.by_name("lat")?;
    let lon: Array1<f32> = npz.by_name("lon")?;
    let time = hours
        .iter()
        .map(|&h| hours_to_datetime(h))
        .collect::<Result<Vec<_>, _>>()?;

    let mut vars = Vec::with_capacity(meta.vars.len());
    for m in meta.vars {
        let data: Array4<f32> = npz.by_name(&m.var)?;
        vars.push(PredictedVar {
            name: m.var,
            levels: m.levels,
            data,
        });
    }
    Ok(PredictionSet {
        time,
        lat,
        lon,
        vars,
    })
}
