pub mod container;
pub mod packer;
pub mod writer;

#[cfg(feature = "netcdf")]
pub mod netcdf_io;

use chrono::{DateTime, Datelike, Utc};
use ndarray::{Array1, Array4, Axis};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("npz read error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("npz write error: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("npy read error: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("variable not found: {0}")]
    MissingVariable(String),

    #[error("coordinate mismatch for '{var}': {detail}")]
    CoordinateMismatch { var: String, detail: String },

    #[error("invalid time value: {0}")]
    InvalidTime(f64),

    #[error("no input files for: {0}")]
    NoInput(String),

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[cfg(feature = "netcdf")]
    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),
}

/// One variable's gridded values, indexed (time, lat, lon, level).
///
/// Surface and constant fields carry a trivial level axis of length 1 and
/// `levels == None`. Constant fields additionally have a time axis of length 1
/// and are broadcast along time by consumers.
#[derive(Debug, Clone)]
pub struct VarField {
    pub data: Array4<f32>,
    pub levels: Option<Vec<i32>>,
}

impl VarField {
    pub fn n_levels(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// Index of a pressure level within this field, if present.
    pub fn level_index(&self, level: i32) -> Option<usize> {
        self.levels
            .as_ref()
            .and_then(|ls| ls.iter().position(|&l| l == level))
    }
}

/// A merged dataset of named variables sharing time/lat/lon coordinates.
#[derive(Debug, Clone)]
pub struct GriddedField {
    pub time: Vec<DateTime<Utc>>,
    pub lat: Array1<f32>,
    pub lon: Array1<f32>,
    vars: HashMap<String, VarField>,
}

impl GriddedField {
    pub fn new(time: Vec<DateTime<Utc>>, lat: Array1<f32>, lon: Array1<f32>) -> Self {
        Self {
            time,
            lat,
            lon,
            vars: HashMap::new(),
        }
    }

    pub fn n_time(&self) -> usize {
        self.time.len()
    }

    pub fn n_lat(&self) -> usize {
        self.lat.len()
    }

    pub fn n_lon(&self) -> usize {
        self.lon.len()
    }

    pub fn var(&self, name: &str) -> Option<&VarField> {
        self.vars.get(name)
    }

    pub fn var_names(&self) -> Vec<&str> {
        self.vars.keys().map(|s| s.as_str()).collect()
    }

    /// Insert a variable, checking its shape against the shared coordinates.
    ///
    /// The time axis must match the dataset length, or be 1 for a constant
    /// field.
    pub fn insert_var(&mut self, name: &str, field: VarField) -> Result<(), DataError> {
        let (nt, nlat, nlon, nlev) = field.data.dim();
        if nt != self.time.len() && nt != 1 {
            return Err(DataError::CoordinateMismatch {
                var: name.to_string(),
                detail: format!("time axis {} vs dataset {}", nt, self.time.len()),
            });
        }
        if nlat != self.n_lat() || nlon != self.n_lon() {
            return Err(DataError::CoordinateMismatch {
                var: name.to_string(),
                detail: format!(
                    "grid {}x{} vs dataset {}x{}",
                    nlat,
                    nlon,
                    self.n_lat(),
                    self.n_lon()
                ),
            });
        }
        if let Some(levels) = &field.levels {
            if levels.len() != nlev {
                return Err(DataError::CoordinateMismatch {
                    var: name.to_string(),
                    detail: format!("{} level labels for {} slots", levels.len(), nlev),
                });
            }
        }
        self.vars.insert(name.to_string(), field);
        Ok(())
    }

    /// Restrict the dataset to an inclusive year range.
    ///
    /// Constant fields (time axis of length 1) are carried over unchanged.
    pub fn select_years(&self, start_year: i32, end_year: i32) -> GriddedField {
        let keep: Vec<usize> = self
            .time
            .iter()
            .enumerate()
            .filter(|(_, t)| t.year() >= start_year && t.year() <= end_year)
            .map(|(i, _)| i)
            .collect();

        let time: Vec<DateTime<Utc>> = keep.iter().map(|&i| self.time[i]).collect();
        let mut out = GriddedField::new(time, self.lat.clone(), self.lon.clone());
        for (name, field) in &self.vars {
            let data = if field.data.len_of(Axis(0)) == 1 {
                field.data.clone()
            } else {
                field.data.select(Axis(0), &keep)
            };
            out.vars.insert(
                name.clone(),
                VarField {
                    data,
                    levels: field.levels.clone(),
                },
            );
        }
        out
    }
}

/// Convert a time coordinate value (hours since the Unix epoch) to a datetime.
pub fn hours_to_datetime(hours: f64) -> Result<DateTime<Utc>, DataError> {
    DateTime::<Utc>::from_timestamp((hours * 3600.0).round() as i64, 0)
        .ok_or(DataError::InvalidTime(hours))
}

/// Convert a datetime to hours since the Unix epoch.
pub fn datetime_to_hours(t: &DateTime<Utc>) -> f64 {
    t.timestamp() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array4;

    fn hourly_times(n: usize) -> Vec<DateTime<Utc>> {
        let base = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| base + chrono::Duration::hours(i as i64))
            .collect()
    }

    #[test]
    fn test_insert_var_shape_check() {
        let mut ds = GriddedField::new(
            hourly_times(4),
            Array1::from(vec![0.0f32, 1.0]),
            Array1::from(vec![0.0f32, 1.0, 2.0]),
        );
        let ok = VarField {
            data: Array4::zeros((4, 2, 3, 1)),
            levels: None,
        };
        assert!(ds.insert_var("t2m", ok).is_ok());

        let bad = VarField {
            data: Array4::zeros((4, 3, 3, 1)),
            levels: None,
        };
        assert!(matches!(
            ds.insert_var("u10", bad),
            Err(DataError::CoordinateMismatch { .. })
        ));
    }

    #[test]
    fn test_select_years_inclusive() {
        let times: Vec<DateTime<Utc>> = (2014..=2017)
            .map(|y| Utc.with_ymd_and_hms(y, 6, 1, 0, 0, 0).unwrap())
            .collect();
        let mut ds = GriddedField::new(
            times,
            Array1::from(vec![0.0f32]),
            Array1::from(vec![0.0f32]),
        );
        let data = Array4::from_shape_fn((4, 1, 1, 1), |(t, _, _, _)| t as f32);
        ds.insert_var("z", VarField { data, levels: None }).unwrap();

        let sel = ds.select_years(2015, 2016);
        assert_eq!(sel.n_time(), 2);
        assert_eq!(sel.time[0].year(), 2015);
        assert_eq!(sel.time[1].year(), 2016);
        let z = sel.var("z").unwrap();
        assert_eq!(z.data[[0, 0, 0, 0]], 1.0);
        assert_eq!(z.data[[1, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_constant_field_survives_year_selection() {
        let times: Vec<DateTime<Utc>> = (2014..=2017)
            .map(|y| Utc.with_ymd_and_hms(y, 6, 1, 0, 0, 0).unwrap())
            .collect();
        let mut ds = GriddedField::new(
            times,
            Array1::from(vec![0.0f32]),
            Array1::from(vec![0.0f32]),
        );
        ds.insert_var(
            "orography",
            VarField {
                data: Array4::from_elem((1, 1, 1, 1), 7.0),
                levels: None,
            },
        )
        .unwrap();

        let sel = ds.select_years(2016, 2016);
        assert_eq!(sel.var("orography").unwrap().data.len_of(Axis(0)), 1);
    }

    #[test]
    fn test_time_roundtrip() {
        let t = Utc.with_ymd_and_hms(2017, 3, 4, 18, 0, 0).unwrap();
        let h = datetime_to_hours(&t);
        assert_eq!(hours_to_datetime(h).unwrap(), t);
    }

    #[test]
    fn test_level_index() {
        let field = VarField {
            data: Array4::zeros((1, 1, 1, 3)),
            levels: Some(vec![300, 500, 850]),
        };
        assert_eq!(field.level_index(500), Some(1));
        assert_eq!(field.level_index(1000), None);
    }
}
