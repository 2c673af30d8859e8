//! NetCDF chunk ingestion for the packer (cargo feature `netcdf`).
//!
//! Reads one time-chunked file produced upstream of the pipeline and lifts it
//! into the in-memory container representation. Expects CF-style coordinates:
//! `time` (hours since a reference date), `lat`/`latitude`, `lon`/`longitude`
//! and optionally `level`.

use super::container::{Container, ContainerMeta};
use super::{hours_to_datetime, DataError};
use ndarray::{Array1, Array4};
use std::path::Path;

const COORD_NAMES: &[&str] = &["time", "lat", "latitude", "lon", "longitude", "level"];

/// Hours between 1900-01-01 and the Unix epoch.
const HOURS_1900_TO_EPOCH: f64 = 613_608.0;

fn time_to_epoch_hours(values: Vec<f64>, units_debug: &str) -> Result<Vec<f64>, DataError> {
    // Attribute debug formatting sidesteps version differences in the
    // attribute value enum; we only need a substring check.
    if units_debug.contains("since 1900-01-01") {
        Ok(values.into_iter().map(|h| h - HOURS_1900_TO_EPOCH).collect())
    } else if units_debug.contains("since 1970-01-01") || units_debug.is_empty() {
        Ok(values)
    } else {
        Err(DataError::UnsupportedFormat(format!(
            "time units not understood: {}",
            units_debug
        )))
    }
}

fn coord_f32(file: &netcdf::File, names: &[&str]) -> Result<Array1<f32>, DataError> {
    for name in names {
        if let Some(var) = file.variable(name) {
            let values: Vec<f32> = var.get_values(..)?;
            return Ok(Array1::from(values));
        }
    }
    Err(DataError::MissingVariable(names.join("/")))
}

/// Read one netCDF time chunk into a container.
pub fn read_netcdf_chunk(path: &Path) -> Result<Container, DataError> {
    let file = netcdf::open(path)?;

    let time_var = file
        .variable("time")
        .ok_or_else(|| DataError::MissingVariable("time".to_string()))?;
    let raw_time: Vec<f64> = time_var.get_values(..)?;
    let units = time_var
        .attribute("units")
        .map(|a| format!("{:?}", a))
        .unwrap_or_default();
    let time = time_to_epoch_hours(raw_time, &units)?
        .into_iter()
        .map(hours_to_datetime)
        .collect::<Result<Vec<_>, _>>()?;

    let lat = coord_f32(&file, &["lat", "latitude"])?;
    let lon = coord_f32(&file, &["lon", "longitude"])?;
    let levels: Option<Vec<i32>> = match file.variable("level") {
        Some(var) => Some(var.get_values(..)?),
        None => None,
    };

    let data_var = file
        .variables()
        .find(|v| v.dimensions().len() >= 3 && !COORD_NAMES.contains(&v.name().as_str()))
        .ok_or_else(|| DataError::MissingVariable("<data variable>".to_string()))?;
    let var_name = data_var.name().to_string();
    let dims: Vec<usize> = data_var.dimensions().iter().map(|d| d.len()).collect();
    let values: Vec<f32> = data_var.get_values(..)?;

    let (nt, nlat, nlon) = (time.len(), lat.len(), lon.len());
    let data = match dims.len() {
        // (time, lat, lon) -> trivial level axis
        3 => Array4::from_shape_vec((nt, nlat, nlon, 1), values)?,
        // (time, level, lat, lon) -> (time, lat, lon, level)
        4 => {
            let nlev = dims[1];
            Array4::from_shape_vec((nt, nlev, nlat, nlon), values)?
                .permuted_axes([0, 2, 3, 1])
                .as_standard_layout()
                .into_owned()
        }
        n => {
            return Err(DataError::UnsupportedFormat(format!(
                "{}D variable '{}' in {}",
                n,
                var_name,
                path.display()
            )))
        }
    };

    Ok(Container {
        meta: ContainerMeta {
            var: var_name,
            levels,
            constant: false,
        },
        time,
        lat,
        lon,
        data,
    })
}
