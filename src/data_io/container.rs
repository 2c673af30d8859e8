//! Dense array container files.
//!
//! One container holds a single variable as a dense (time, lat, lon, level)
//! array in an `.npz` archive, with a JSON sidecar carrying the variable name
//! and level labels. The training pipeline random-accesses these after the
//! packer has flattened the per-month archive downloads.

use super::{datetime_to_hours, hours_to_datetime, DataError, GriddedField, VarField};
use chrono::{DateTime, Utc};
use ndarray::{concatenate, Array1, Array4, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Sidecar metadata stored next to the `.npz` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub var: String,
    pub levels: Option<Vec<i32>>,
    /// Time-invariant field stored with a single time slot.
    #[serde(default)]
    pub constant: bool,
}

/// A container loaded into memory.
#[derive(Debug)]
pub struct Container {
    pub meta: ContainerMeta,
    pub time: Vec<DateTime<Utc>>,
    pub lat: Array1<f32>,
    pub lon: Array1<f32>,
    pub data: Array4<f32>,
}

fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Write one variable to `path` (`.npz`) plus its JSON sidecar.
pub fn write_container(
    path: &Path,
    meta: &ContainerMeta,
    time: &[DateTime<Utc>],
    lat: &Array1<f32>,
    lon: &Array1<f32>,
    data: &Array4<f32>,
) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let hours: Array1<f64> = time.iter().map(datetime_to_hours).collect();

    let mut npz = NpzWriter::new(File::create(path)?);
    npz.add_array("fields", data)?;
    npz.add_array("time", &hours)?;
    npz.add_array("lat", lat)?;
    npz.add_array("lon", lon)?;
    npz.finish()?;

    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(sidecar_path(path), json)?;
    Ok(())
}

/// Read a single container file and its sidecar.
pub fn read_container(path: &Path) -> Result<Container, DataError> {
    let json = std::fs::read_to_string(sidecar_path(path))?;
    let meta: ContainerMeta = serde_json::from_str(&json)?;

    let mut npz = NpzReader::new(File::open(path)?)?;
    let data: Array4<f32> = npz.by_name("fields")?;
    let hours: Array1<f64> = npz.by_name("time")?;
    let lat: Array1<f32> = npz.by_name("lat")?;
    let lon: Array1<f32> = npz.by_name("lon")?;

    let time = hours
        .iter()
        .map(|&h| hours_to_datetime(h))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Container {
        meta,
        time,
        lat,
        lon,
        data,
    })
}

/// All `.npz` files under `dir`, sorted by file name so time chunks
/// concatenate in order.
fn list_chunks(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "npz").unwrap_or(false))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(DataError::NoInput(dir.display().to_string()));
    }
    Ok(files)
}

/// Load one variable from `datadir/{var}/*.npz`, concatenating time chunks.
pub fn load_variable(datadir: &Path, var: &str) -> Result<Container, DataError> {
    let files = list_chunks(&datadir.join(var))?;
    let mut merged: Option<Container> = None;
    for file in &files {
        let chunk = read_container(file)?;
        merged = Some(match merged {
            None => chunk,
            Some(mut acc) => {
                if chunk.lat != acc.lat || chunk.lon != acc.lon {
                    return Err(DataError::CoordinateMismatch {
                        var: var.to_string(),
                        detail: format!("grid differs in {}", file.display()),
                    });
                }
                acc.data = concatenate(Axis(0), &[acc.data.view(), chunk.data.view()])?;
                acc.time.extend(chunk.time);
                acc
            }
        });
    }
    // list_chunks guarantees at least one file
    Ok(merged.ok_or_else(|| DataError::NoInput(var.to_string()))?)
}

/// Load and merge per-variable containers into one dataset.
///
/// The first time-varying variable defines the shared coordinates; later
/// variables must match them exactly.
pub fn load_dataset(datadir: &Path, vars: &[String]) -> Result<GriddedField, DataError> {
    let mut loaded: Vec<(String, Container)> = Vec::with_capacity(vars.len());
    for var in vars {
        loaded.push((var.clone(), load_variable(datadir, var)?));
    }

    let (ref_time, ref_lat, ref_lon) = {
        let anchor = loaded
            .iter()
            .find(|(_, c)| !c.meta.constant)
            .or_else(|| loaded.first())
            .ok_or_else(|| DataError::NoInput(datadir.display().to_string()))?;
        (
            anchor.1.time.clone(),
            anchor.1.lat.clone(),
            anchor.1.lon.clone(),
        )
    };

    let mut ds = GriddedField::new(ref_time, ref_lat, ref_lon);
    for (var, container) in loaded {
        if !container.meta.constant && container.time != ds.time {
            return Err(DataError::CoordinateMismatch {
                var,
                detail: "time coordinate differs between variables".to_string(),
            });
        }
        ds.insert_var(
            &var,
            VarField {
                data: container.data,
                levels: container.meta.levels.clone(),
            },
        )?;
    }
    Ok(ds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn times(n: usize) -> Vec<DateTime<Utc>> {
        let base = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| base + chrono::Duration::hours(6 * i as i64))
            .collect()
    }

    #[test]
    fn test_container_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z").join("z_2016.npz");

        let data = Array4::from_shape_fn((5, 3, 4, 2), |(t, j, i, l)| {
            (t * 100 + j * 10 + i + l) as f32
        });
        let meta = ContainerMeta {
            var: "z".to_string(),
            levels: Some(vec![500, 850]),
            constant: false,
        };
        let lat = Array1::from(vec![-45.0f32, 0.0, 45.0]);
        let lon = Array1::from(vec![0.0f32, 90.0, 180.0, 270.0]);
        write_container(&path, &meta, &times(5), &lat, &lon, &data).unwrap();

        let back = read_container(&path).unwrap();
        assert_eq!(back.meta.var, "z");
        assert_eq!(back.meta.levels, Some(vec![500, 850]));
        assert_eq!(back.data, data);
        assert_eq!(back.time, times(5));
        assert_eq!(back.lat, lat);
        assert_eq!(back.lon, lon);
    }

    #[test]
    fn test_load_variable_concatenates_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let lat = Array1::from(vec![0.0f32]);
        let lon = Array1::from(vec![0.0f32]);
        let meta = ContainerMeta {
            var: "t2m".to_string(),
            levels: None,
            constant: false,
        };

        let all_times = times(6);
        let a = Array4::from_elem((4, 1, 1, 1), 1.0f32);
        let b = Array4::from_elem((2, 1, 1, 1), 2.0f32);
        write_container(
            &dir.path().join("t2m/t2m_01.npz"),
            &meta,
            &all_times[..4],
            &lat,
            &lon,
            &a,
        )
        .unwrap();
        write_container(
            &dir.path().join("t2m/t2m_02.npz"),
            &meta,
            &all_times[4..],
            &lat,
            &lon,
            &b,
        )
        .unwrap();

        let merged = load_variable(dir.path(), "t2m").unwrap();
        assert_eq!(merged.data.len_of(Axis(0)), 6);
        assert_eq!(merged.time, all_times);
        assert_eq!(merged.data[[0, 0, 0, 0]], 1.0);
        assert_eq!(merged.data[[5, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_load_dataset_missing_variable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dataset(dir.path(), &["ghost".to_string()]);
        assert!(matches!(err, Err(DataError::NoInput(_))));
    }
}
