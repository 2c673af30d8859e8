//! Training and evaluation driver.
//!
//! Loads the per-variable containers, splits them into train/validation/test
//! years, fits the periodic CNN with early stopping on the validation loss,
//! then writes a weight snapshot and verified forecasts for the test years.

use crate::config::TrainConfig;
use crate::data_io::container::load_dataset;
use crate::data_io::writer::{split_predictions, write_predictions};
use crate::data_io::DataError;
use crate::generator::{DataGenerator, GeneratorError, GeneratorOptions};
use crate::nn::{Adam, ModelError, Network};
use crate::score::{score_predictions, Score};
use log::{info, warn};
use ndarray::{s, Array4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

fn ranges_overlap(a: (i32, i32), b: (i32, i32)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

fn mean_eval(net: &Network, dg: &DataGenerator) -> Result<f32, TrainError> {
    let mut total = 0.0f32;
    let mut n = 0.0f32;
    for b in 0..dg.num_batches() {
        let (x, y) = dg.get_batch(b);
        let weight = x.len_of(ndarray::Axis(0)) as f32;
        total += net.evaluate(&x, &y)? * weight;
        n += weight;
    }
    Ok(total / n)
}

/// Run the full pipeline described by `config`; returns the verification
/// scores for the test years.
pub fn run_training(config: &TrainConfig) -> Result<Vec<Score>, TrainError> {
    let var_names = config.var_spec.data_var_names();
    info!(
        "loading {} variables from {}",
        var_names.len(),
        config.datadir.display()
    );
    let ds = load_dataset(&config.datadir, &var_names)?;

    for (a, b, what) in [
        (config.train_years, config.valid_years, "train/validation"),
        (config.train_years, config.test_years, "train/test"),
        (config.valid_years, config.test_years, "validation/test"),
    ] {
        if ranges_overlap(a, b) {
            warn!("{} year ranges overlap ({:?} vs {:?})", what, a, b);
        }
    }

    let ds_train = ds.select_years(config.train_years.0, config.train_years.1);
    let ds_valid = ds.select_years(config.valid_years.0, config.valid_years.1);
    let ds_test = ds.select_years(config.test_years.0, config.test_years.1);

    let dg_train = DataGenerator::new(
        &ds_train,
        &config.var_spec,
        GeneratorOptions {
            lead_time: config.lead_time,
            batch_size: config.batch_size,
            shuffle: true,
            norm: None,
            output_patterns: config.output_vars.clone(),
            seed: config.seed,
        },
    )?;
    let dependent_options = |seed_offset: u64| GeneratorOptions {
        lead_time: config.lead_time,
        batch_size: config.batch_size,
        shuffle: false,
        norm: Some(dg_train.normalization().clone()),
        output_patterns: config.output_vars.clone(),
        seed: config.seed + seed_offset,
    };
    let dg_valid = DataGenerator::new(&ds_valid, &config.var_spec, dependent_options(1))?;
    let dg_test = DataGenerator::new(&ds_test, &config.var_spec, dependent_options(2))?;

    info!(
        "{} train / {} validation / {} test samples, {} input channels, {} output channels",
        dg_train.n_samples(),
        dg_valid.n_samples(),
        dg_test.n_samples(),
        dg_train.num_channels(),
        dg_train.num_output_channels()
    );

    if *config.filters.last().unwrap_or(&0) != dg_train.num_output_channels() {
        return Err(TrainError::Model(ModelError::ChannelMismatch {
            expected: dg_train.num_output_channels(),
            actual: *config.filters.last().unwrap_or(&0),
        }));
    }

    let mut net = Network::build(
        dg_train.num_channels(),
        &config.filters,
        &config.kernels,
        config.activation,
        config.dropout,
        config.seed,
    )?;
    let mut opt = Adam::new(config.learning_rate);
    let mut dg_train = dg_train;

    let mut best_valid = f32::INFINITY;
    let mut epochs_without_improvement = 0usize;
    for epoch in 1..=config.max_epochs {
        let mut train_loss = 0.0f32;
        for b in 0..dg_train.num_batches() {
            let (x, y) = dg_train.get_batch(b);
            train_loss += net.train_step(&x, &y, &mut opt)?;
        }
        train_loss /= dg_train.num_batches() as f32;
        dg_train.reset_epoch();

        let valid_loss = mean_eval(&net, &dg_valid)?;
        info!(
            "epoch {:3}: train mse {:.6}, validation mse {:.6}",
            epoch, train_loss, valid_loss
        );

        if valid_loss < best_valid {
            best_valid = valid_loss;
            epochs_without_improvement = 0;
        } else {
            epochs_without_improvement += 1;
            if epochs_without_improvement >= config.patience {
                info!(
                    "validation loss stalled for {} epochs, stopping after epoch {}",
                    config.patience, epoch
                );
                break;
            }
        }
    }

    net.save_weights(&config.model_path)?;
    info!("saved weights to {}", config.model_path.display());

    // Ordered forecasts for the test years, back in physical units.
    let (nlat, nlon) = (ds_test.n_lat(), ds_test.n_lon());
    let mut preds = Array4::<f32>::zeros((
        dg_test.n_samples(),
        nlat,
        nlon,
        dg_test.num_output_channels(),
    ));
    for b in 0..dg_test.num_batches() {
        let (x, _) = dg_test.get_batch(b);
        let out = net.forward(&x)?;
        let start = b * config.batch_size;
        let end = start + out.len_of(ndarray::Axis(0));
        preds.slice_mut(s![start..end, .., .., ..]).assign(&out);
    }
    dg_test.output_normalization().denormalize(&mut preds);

    let pred_set = split_predictions(
        &preds,
        &dg_test.output_level_names(),
        dg_test.valid_time(),
        dg_test.lat(),
        dg_test.lon(),
    );
    write_predictions(&config.pred_path, &pred_set)?;
    info!(
        "wrote {} forecast times to {}",
        pred_set.time.len(),
        config.pred_path.display()
    );

    Ok(score_predictions(&config.datadir, &pred_set))
}
