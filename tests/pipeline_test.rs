//! End-to-end pipeline test: synthetic monthly chunks are packed into
//! containers, a small periodic CNN is trained on them, and the resulting
//! forecast file is verified against the archive.

use chrono::{DateTime, Duration, TimeZone, Utc};
use gridcast::config::{TrainConfig, VarSpec};
use gridcast::data_io::container::{read_container, write_container, ContainerMeta};
use gridcast::data_io::packer::{pack_variable, PackOptions};
use gridcast::data_io::writer::read_predictions;
use gridcast::nn::Activation;
use gridcast::training::run_training;
use ndarray::{Array1, Array4, Axis};
use std::path::Path;

fn six_hourly(start_year: i32, n: usize) -> Vec<DateTime<Utc>> {
    let base = Utc.with_ymd_and_hms(start_year, 1, 1, 0, 0, 0).unwrap();
    (0..n).map(|i| base + Duration::hours(6 * i as i64)).collect()
}

fn grid() -> (Array1<f32>, Array1<f32>) {
    (
        Array1::from(vec![-60.0f32, -20.0, 20.0, 60.0]),
        Array1::from(vec![0.0f32, 60.0, 120.0, 180.0, 240.0, 300.0]),
    )
}

/// A smooth field the network can fit: a travelling wave around the globe.
fn wave_field(time: &[DateTime<Utc>], nlat: usize, nlon: usize, offset: f32) -> Array4<f32> {
    Array4::from_shape_fn((time.len(), nlat, nlon, 1), |(t, j, i, _)| {
        let phase = 2.0 * std::f32::consts::PI * (i as f32 / nlon as f32 + t as f32 * 0.01);
        offset + phase.sin() * (1.0 + 0.2 * j as f32)
    })
}

fn write_archive(datadir: &Path, var: &str, years: std::ops::RangeInclusive<i32>, offset: f32) {
    let (lat, lon) = grid();
    let meta = ContainerMeta {
        var: var.to_string(),
        levels: None,
        constant: false,
    };
    for year in years {
        // Short "years" keep the test fast while still exercising the
        // year-based splits.
        let time = six_hourly(year, 60);
        let data = wave_field(&time, lat.len(), lon.len(), offset);
        write_container(
            &datadir.join(var).join(format!("{}_{}.npz", var, year)),
            &meta,
            &time,
            &lat,
            &lon,
            &data,
        )
        .unwrap();
    }
}

#[test]
fn test_pack_then_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (lat, lon) = grid();
    let meta = ContainerMeta {
        var: "t2m".to_string(),
        levels: None,
        constant: false,
    };

    let all_times = six_hourly(2015, 10);
    let chunk_a = dir.path().join("t2m_01.npz");
    let chunk_b = dir.path().join("t2m_02.npz");
    let data = wave_field(&all_times, lat.len(), lon.len(), 280.0);
    write_container(
        &chunk_a,
        &meta,
        &all_times[..6],
        &lat,
        &lon,
        &data.slice(ndarray::s![..6, .., .., ..]).to_owned(),
    )
    .unwrap();
    write_container(
        &chunk_b,
        &meta,
        &all_times[6..],
        &lat,
        &lon,
        &data.slice(ndarray::s![6.., .., .., ..]).to_owned(),
    )
    .unwrap();

    let packed_path = dir.path().join("packed/t2m.npz");
    let summary = pack_variable(
        &[chunk_a, chunk_b],
        &packed_path,
        &PackOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.total_timesteps, 10);

    let packed = read_container(&packed_path).unwrap();
    assert_eq!(packed.time, all_times);
    assert_eq!(packed.data, data);
}

#[test]
fn test_train_writes_snapshot_predictions_and_scores() {
    let dir = tempfile::tempdir().unwrap();
    let datadir = dir.path().join("data");
    write_archive(&datadir, "t2m", 2013..=2017, 280.0);

    let config = TrainConfig {
        datadir: datadir.clone(),
        model_path: dir.path().join("weights.npz"),
        pred_path: dir.path().join("preds.npz"),
        var_spec: VarSpec::parse("t2m").unwrap(),
        output_vars: None,
        filters: vec![8, 1],
        kernels: vec![3, 3],
        lead_time: 2,
        learning_rate: 1e-3,
        activation: Activation::Elu,
        dropout: 0.0,
        batch_size: 16,
        patience: 2,
        max_epochs: 3,
        train_years: (2013, 2015),
        valid_years: (2016, 2016),
        test_years: (2017, 2017),
        seed: 5,
    };
    config.validate().unwrap();

    let scores = run_training(&config).unwrap();
    assert!(config.model_path.exists());
    assert!(config.pred_path.exists());

    // 60 test timesteps at lead 2 give 58 forecasts on the shifted times.
    let preds = read_predictions(&config.pred_path).unwrap();
    assert_eq!(preds.vars.len(), 1);
    assert_eq!(preds.vars[0].name, "t2m");
    assert_eq!(preds.vars[0].data.len_of(Axis(0)), 58);
    assert_eq!(preds.time.len(), 58);
    assert_eq!(preds.time[0], six_hourly(2017, 60)[2]);

    // The archive covers the forecast times, so the variable verifies.
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].name, "t2m");
    assert!(scores[0].rmse.is_finite());
}

#[test]
fn test_missing_truth_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let datadir = dir.path().join("data");
    write_archive(&datadir, "t2m", 2013..=2017, 280.0);
    write_archive(&datadir, "u10", 2013..=2017, 0.0);

    let config = TrainConfig {
        datadir: datadir.clone(),
        model_path: dir.path().join("weights.npz"),
        pred_path: dir.path().join("preds.npz"),
        var_spec: VarSpec::parse("t2m,u10").unwrap(),
        output_vars: Some(vec!["t2m".to_string()]),
        filters: vec![4, 1],
        kernels: vec![3, 3],
        lead_time: 1,
        learning_rate: 1e-3,
        activation: Activation::Elu,
        dropout: 0.0,
        batch_size: 32,
        patience: 1,
        max_epochs: 1,
        train_years: (2013, 2015),
        valid_years: (2016, 2016),
        test_years: (2017, 2017),
        seed: 9,
    };

    let scores = run_training(&config).unwrap();
    assert_eq!(scores.len(), 1);

    // Scoring against a directory with no archive skips every variable
    // instead of failing.
    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    let preds = read_predictions(&config.pred_path).unwrap();
    let none = gridcast::score::score_predictions(&empty, &preds);
    assert!(none.is_empty());
}
