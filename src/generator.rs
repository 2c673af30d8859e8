//! Windowed data generator.
//!
//! Stacks the variables of a [`GriddedField`] into one normalized
//! (time, lat, lon, slot) array and serves (input, target) minibatches offset
//! by the forecast lead time. Normalization statistics are computed here on
//! the training split and passed in unchanged for dependent splits.

use crate::config::{VarSpec, VarSpecEntry};
use crate::data_io::GriddedField;
use chrono::{DateTime, Utc};
use log::warn;
use ndarray::{s, Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("variable not found in dataset: {0}")]
    MissingVariable(String),

    #[error("level {level} not present for variable '{var}'")]
    MissingLevel { var: String, level: i32 },

    #[error("invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("{n_time} timesteps cannot serve lead time {lead_time}")]
    NotEnoughTimesteps { n_time: usize, lead_time: usize },
}

/// Per-slot normalization statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Array1<f32>,
    pub std: Array1<f32>,
}

impl Normalization {
    /// Statistics restricted to a subset of slots.
    pub fn subset(&self, idxs: &[usize]) -> Normalization {
        Normalization {
            mean: self.mean.select(Axis(0), idxs),
            std: self.std.select(Axis(0), idxs),
        }
    }

    /// Apply `(x - mean) / std` along the trailing slot axis.
    pub fn normalize(&self, data: &mut Array4<f32>) {
        for (slot, (&m, &sd)) in self.mean.iter().zip(self.std.iter()).enumerate() {
            data.slice_mut(s![.., .., .., slot])
                .mapv_inplace(|v| (v - m) / sd);
        }
    }

    /// Invert [`Normalization::normalize`].
    pub fn denormalize(&self, data: &mut Array4<f32>) {
        for (slot, (&m, &sd)) in self.mean.iter().zip(self.std.iter()).enumerate() {
            data.slice_mut(s![.., .., .., slot])
                .mapv_inplace(|v| v * sd + m);
        }
    }
}

/// Construction options for [`DataGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Forecast lead time in timesteps.
    pub lead_time: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    /// Reuse externally computed statistics instead of computing them.
    pub norm: Option<Normalization>,
    /// Anchored regex patterns selecting output slots; `None` keeps all.
    pub output_patterns: Option<Vec<String>>,
    pub seed: u64,
}

enum SlotSource<'a> {
    /// (field, level index) with a full time axis.
    Timed(&'a crate::data_io::VarField, usize),
    /// Time-invariant slice broadcast along time.
    Constant(&'a crate::data_io::VarField, usize),
}

pub struct DataGenerator {
    data: Array4<f32>,
    level_names: Vec<String>,
    output_idxs: Vec<usize>,
    norm: Normalization,
    lead_time: usize,
    batch_size: usize,
    shuffle: bool,
    idxs: Vec<usize>,
    init_time: Vec<DateTime<Utc>>,
    valid_time: Vec<DateTime<Utc>>,
    lat: Array1<f32>,
    lon: Array1<f32>,
    rng: StdRng,
}

fn compute_stats(data: &Array4<f32>) -> Normalization {
    let n_slots = data.len_of(Axis(3));
    let mut mean = Array1::<f32>::zeros(n_slots);
    let mut std = Array1::<f32>::zeros(n_slots);
    for slot in 0..n_slots {
        let view = data.index_axis(Axis(3), slot);
        let n = view.len() as f64;
        let m = view.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = view.iter().map(|&v| (v as f64 - m).powi(2)).sum::<f64>() / n;
        let mut sd = var.sqrt() as f32;
        if sd == 0.0 {
            warn!("slot {} has zero variance, leaving it unscaled", slot);
            sd = 1.0;
        }
        mean[slot] = m as f32;
        std[slot] = sd;
    }
    Normalization { mean, std }
}

fn select_outputs(
    level_names: &[String],
    patterns: Option<&[String]>,
) -> Result<Vec<usize>, GeneratorError> {
    match patterns {
        None => Ok((0..level_names.len()).collect()),
        Some(patterns) => {
            let regexes = patterns
                .iter()
                .map(|p| Regex::new(&format!("^(?:{})", p)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(level_names
                .iter()
                .enumerate()
                .filter(|(_, name)| regexes.iter().any(|re| re.is_match(name)))
                .map(|(i, _)| i)
                .collect())
        }
    }
}

impl DataGenerator {
    pub fn new(
        ds: &GriddedField,
        spec: &VarSpec,
        options: GeneratorOptions,
    ) -> Result<Self, GeneratorError> {
        let (nt, nlat, nlon) = (ds.n_time(), ds.n_lat(), ds.n_lon());
        if nt <= options.lead_time {
            return Err(GeneratorError::NotEnoughTimesteps {
                n_time: nt,
                lead_time: options.lead_time,
            });
        }

        // Resolve the spec into one source per level slot.
        let mut sources: Vec<SlotSource> = Vec::new();
        let mut level_names: Vec<String> = Vec::new();
        for entry in &spec.entries {
            match entry {
                VarSpecEntry::Var { name, levels } => {
                    let field = ds
                        .var(name)
                        .ok_or_else(|| GeneratorError::MissingVariable(name.clone()))?;
                    match (levels, &field.levels) {
                        (Some(requested), Some(_)) => {
                            for &level in requested {
                                let li = field.level_index(level).ok_or_else(|| {
                                    GeneratorError::MissingLevel {
                                        var: name.clone(),
                                        level,
                                    }
                                })?;
                                level_names.push(format!("{}_{}", name, level));
                                sources.push(SlotSource::Timed(field, li));
                            }
                        }
                        // Levels requested from a single-level field: fall
                        // back to the one slot it has.
                        (Some(_), None) => {
                            level_names.push(name.clone());
                            sources.push(SlotSource::Timed(field, 0));
                        }
                        (None, Some(present)) => {
                            for (li, level) in present.iter().enumerate() {
                                level_names.push(format!("{}_{}", name, level));
                                sources.push(SlotSource::Timed(field, li));
                            }
                        }
                        (None, None) => {
                            level_names.push(name.clone());
                            sources.push(SlotSource::Timed(field, 0));
                        }
                    }
                }
                VarSpecEntry::Constants(names) => {
                    for name in names {
                        let field = ds
                            .var(name)
                            .ok_or_else(|| GeneratorError::MissingVariable(name.clone()))?;
                        level_names.push(name.clone());
                        sources.push(SlotSource::Constant(field, 0));
                    }
                }
            }
        }

        // Stack along the slot axis, broadcasting constants along time.
        let mut data = Array4::<f32>::zeros((nt, nlat, nlon, sources.len()));
        for (slot, source) in sources.iter().enumerate() {
            match source {
                SlotSource::Timed(field, li) if field.data.len_of(Axis(0)) != 1 => {
                    data.slice_mut(s![.., .., .., slot])
                        .assign(&field.data.slice(s![.., .., .., *li]));
                }
                SlotSource::Timed(field, li) | SlotSource::Constant(field, li) => {
                    let plane = field.data.slice(s![0, .., .., *li]);
                    for mut step in data.slice_mut(s![.., .., .., slot]).outer_iter_mut() {
                        step.assign(&plane);
                    }
                }
            }
        }

        let output_idxs = select_outputs(&level_names, options.output_patterns.as_deref())?;

        let norm = match options.norm {
            Some(norm) => norm,
            None => compute_stats(&data),
        };
        norm.normalize(&mut data);

        let n_samples = nt - options.lead_time;
        let init_time = ds.time[..n_samples].to_vec();
        let valid_time = ds.time[options.lead_time..].to_vec();

        let mut generator = Self {
            data,
            level_names,
            output_idxs,
            norm,
            lead_time: options.lead_time,
            batch_size: options.batch_size,
            shuffle: options.shuffle,
            idxs: Vec::new(),
            init_time,
            valid_time,
            lat: ds.lat.clone(),
            lon: ds.lon.clone(),
            rng: StdRng::seed_from_u64(options.seed),
        };
        generator.reset_epoch();
        Ok(generator)
    }

    pub fn n_samples(&self) -> usize {
        self.data.len_of(Axis(0)) - self.lead_time
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.n_samples().div_ceil(self.batch_size)
    }

    pub fn num_channels(&self) -> usize {
        self.level_names.len()
    }

    pub fn num_output_channels(&self) -> usize {
        self.output_idxs.len()
    }

    pub fn level_names(&self) -> &[String] {
        &self.level_names
    }

    pub fn output_level_names(&self) -> Vec<String> {
        self.output_idxs
            .iter()
            .map(|&i| self.level_names[i].clone())
            .collect()
    }

    pub fn output_idxs(&self) -> &[usize] {
        &self.output_idxs
    }

    pub fn normalization(&self) -> &Normalization {
        &self.norm
    }

    /// Statistics for the output slots only, for denormalizing predictions.
    pub fn output_normalization(&self) -> Normalization {
        self.norm.subset(&self.output_idxs)
    }

    pub fn init_time(&self) -> &[DateTime<Utc>] {
        &self.init_time
    }

    pub fn valid_time(&self) -> &[DateTime<Utc>] {
        &self.valid_time
    }

    pub fn lat(&self) -> &Array1<f32> {
        &self.lat
    }

    pub fn lon(&self) -> &Array1<f32> {
        &self.lon
    }

    /// Regenerate the sample index sequence: a fresh permutation when
    /// shuffling, ascending order otherwise.
    pub fn reset_epoch(&mut self) {
        self.idxs = (0..self.n_samples()).collect();
        if self.shuffle {
            self.idxs.shuffle(&mut self.rng);
        }
    }

    /// One minibatch: inputs at the selected times, targets `lead_time`
    /// later restricted to the output slots. The final batch of an epoch may
    /// be short.
    pub fn get_batch(&self, batch: usize) -> (Array4<f32>, Array4<f32>) {
        let start = batch * self.batch_size;
        let end = (start + self.batch_size).min(self.n_samples());
        let idxs = &self.idxs[start..end];
        let shifted: Vec<usize> = idxs.iter().map(|&i| i + self.lead_time).collect();

        let x = self.data.select(Axis(0), idxs);
        let y = self
            .data
            .select(Axis(0), &shifted)
            .select(Axis(3), &self.output_idxs);
        (x, y)
    }
}
