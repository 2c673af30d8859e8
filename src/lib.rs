//! Gridcast: download, pack and learn from gridded weather reanalysis data.
//!
//! The pipeline has three stages, each a CLI subcommand:
//! 1. `download` fetches monthly archive files for one variable,
//! 2. `pack` flattens the monthly chunks into dense array containers,
//! 3. `train` fits a periodic-boundary CNN on the packed containers and
//!    writes verified forecasts.

pub mod config;
pub mod data_io;
pub mod download;
pub mod generator;
pub mod nn;
pub mod score;
pub mod training;
