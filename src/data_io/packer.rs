//! Array container builder.
//!
//! Flattens time-chunked per-variable files (one file per month of archive
//! output) into a single dense container. The total length is derived from
//! the chunk lengths rather than assumed, and each chunk lands in its
//! contiguous slice of the pre-allocated array.
//!
//! Accumulated fields (archive precipitation is a running total over forecast
//! steps) can be de-accumulated with a first difference along time and scaled
//! to target units before packing.

use super::container::{read_container, write_container, Container};
use super::DataError;
use log::info;
use ndarray::{s, Array4, Axis};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PackOptions {
    /// First-difference along time within each chunk.
    pub deaccumulate: bool,
    /// Unit scale applied before de-accumulation (e.g. 1e-3 for mm -> m).
    pub scale: f32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            deaccumulate: false,
            scale: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct PackSummary {
    pub chunks: usize,
    pub total_timesteps: usize,
}

fn read_chunk(path: &Path) -> Result<Container, DataError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npz") => read_container(path),
        #[cfg(feature = "netcdf")]
        Some("nc") => super::netcdf_io::read_netcdf_chunk(path),
        _ => Err(DataError::UnsupportedFormat(path.display().to_string())),
    }
}

fn deaccumulate(chunk: &mut Container) {
    let diff =
        &chunk.data.slice(s![1.., .., .., ..]) - &chunk.data.slice(s![..-1, .., .., ..]);
    chunk.data = diff;
    chunk.time.remove(0);
}

/// Pack time-chunked source files into one dense container at `output`.
pub fn pack_variable(
    inputs: &[PathBuf],
    output: &Path,
    options: &PackOptions,
) -> Result<PackSummary, DataError> {
    if inputs.is_empty() {
        return Err(DataError::NoInput(output.display().to_string()));
    }

    let mut chunks: Vec<Container> = Vec::with_capacity(inputs.len());
    for path in inputs {
        let mut chunk = read_chunk(path)?;
        if options.scale != 1.0 {
            let scale = options.scale;
            chunk.data.mapv_inplace(|v| v * scale);
        }
        if options.deaccumulate {
            deaccumulate(&mut chunk);
        }
        if let Some(first) = chunks.first() {
            if chunk.lat != first.lat || chunk.lon != first.lon {
                return Err(DataError::CoordinateMismatch {
                    var: chunk.meta.var.clone(),
                    detail: format!("grid differs in {}", path.display()),
                });
            }
            if chunk.data.len_of(Axis(3)) != first.data.len_of(Axis(3)) {
                return Err(DataError::CoordinateMismatch {
                    var: chunk.meta.var.clone(),
                    detail: format!("level count differs in {}", path.display()),
                });
            }
        }
        chunks.push(chunk);
    }

    // Total length derived from the chunks themselves.
    let total: usize = chunks.iter().map(|c| c.data.len_of(Axis(0))).sum();
    let first = &chunks[0];
    let (_, nlat, nlon, nlev) = first.data.dim();

    let mut fields = Array4::<f32>::zeros((total, nlat, nlon, nlev));
    let mut time = Vec::with_capacity(total);
    let mut offset = 0;
    for chunk in &chunks {
        let nt = chunk.data.len_of(Axis(0));
        fields
            .slice_mut(s![offset..offset + nt, .., .., ..])
            .assign(&chunk.data);
        time.extend_from_slice(&chunk.time);
        offset += nt;
    }

    write_container(
        output,
        &first.meta,
        &time,
        &first.lat,
        &first.lon,
        &fields,
    )?;
    info!(
        "packed {} chunks ({} timesteps) into {}",
        chunks.len(),
        total,
        output.display()
    );

    Ok(PackSummary {
        chunks: chunks.len(),
        total_timesteps: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_io::container::ContainerMeta;
    use chrono::{DateTime, TimeZone, Utc};
    use ndarray::Array1;

    fn times(n: usize, offset: usize) -> Vec<DateTime<Utc>> {
        let base = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| base + chrono::Duration::hours(6 * (offset + i) as i64))
            .collect()
    }

    fn write_chunk(path: &Path, nt: usize, offset: usize, fill: impl Fn(usize) -> f32) {
        let meta = ContainerMeta {
            var: "tp".to_string(),
            levels: None,
            constant: false,
        };
        let lat = Array1::from(vec![0.0f32, 1.0]);
        let lon = Array1::from(vec![0.0f32, 1.0, 2.0]);
        let data = Array4::from_shape_fn((nt, 2, 3, 1), |(t, _, _, _)| fill(t));
        write_container(path, &meta, &times(nt, offset), &lat, &lon, &data).unwrap();
    }

    #[test]
    fn test_pack_derives_total_length() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("tp_01.npz");
        let b = dir.path().join("tp_02.npz");
        write_chunk(&a, 4, 0, |t| t as f32);
        write_chunk(&b, 3, 4, |t| 100.0 + t as f32);

        let out = dir.path().join("packed/tp.npz");
        let summary =
            pack_variable(&[a, b], &out, &PackOptions::default()).unwrap();
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.total_timesteps, 7);

        let packed = read_container(&out).unwrap();
        assert_eq!(packed.data.len_of(Axis(0)), 7);
        assert_eq!(packed.data[[3, 0, 0, 0]], 3.0);
        assert_eq!(packed.data[[4, 0, 0, 0]], 100.0);
        assert_eq!(packed.time.len(), 7);
    }

    #[test]
    fn test_pack_deaccumulate_and_scale() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("tp_01.npz");
        // Accumulated series 0, 1000, 3000 -> 6-hourly increments 1000, 2000.
        write_chunk(&a, 3, 0, |t| (t * t + t) as f32 * 500.0);

        let out = dir.path().join("tp.npz");
        let options = PackOptions {
            deaccumulate: true,
            scale: 1e-3,
        };
        let summary = pack_variable(&[a], &out, &options).unwrap();
        assert_eq!(summary.total_timesteps, 2);

        let packed = read_container(&out).unwrap();
        assert!((packed.data[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((packed.data[[1, 0, 0, 0]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_pack_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("tp.grib");
        std::fs::write(&bogus, b"GRIB").unwrap();
        let out = dir.path().join("tp.npz");
        let err = pack_variable(&[bogus], &out, &PackOptions::default());
        assert!(matches!(err, Err(DataError::UnsupportedFormat(_))));
    }
}
