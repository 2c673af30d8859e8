//! Archive retrieval client.
//!
//! Requests gridded forecast fields from a THORPEX-style archive endpoint,
//! one (year, month) file at a time. Months are fetched independently so a
//! failed request costs one month, not the whole run: failures are logged
//! and skipped, and the summary reports how many months made it.

use crate::config::DownloadConfig;
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("invalid month: {0}")]
    InvalidMonth(u32),
}

/// Archive request parameters for one variable.
struct CatalogEntry {
    param: &'static str,
    levtype: &'static str,
    level: Option<&'static str>,
}

/// Variables the archive serves, with their parameter codes.
fn catalog(var: &str) -> Option<CatalogEntry> {
    let entry = match var {
        "total_precipitation" => CatalogEntry {
            param: "228228",
            levtype: "sfc",
            level: None,
        },
        "z500" => CatalogEntry {
            param: "156",
            levtype: "pl",
            level: Some("500"),
        },
        "t850" => CatalogEntry {
            param: "130",
            levtype: "pl",
            level: Some("850"),
        },
        "u10" => CatalogEntry {
            param: "165",
            levtype: "sfc",
            level: None,
        },
        "v10" => CatalogEntry {
            param: "166",
            levtype: "sfc",
            level: None,
        },
        "2m_temperature" => CatalogEntry {
            param: "167",
            levtype: "sfc",
            level: None,
        },
        _ => return None,
    };
    Some(entry)
}

fn join_steps(max: usize, stride: usize) -> String {
    (0..=max)
        .step_by(stride)
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((next - first).num_days() as u32)
}

fn request_body(
    entry: &CatalogEntry,
    year: i32,
    month: u32,
    ens: bool,
    target: &Path,
) -> Result<serde_json::Value, DownloadError> {
    let last = last_day_of_month(year, month).ok_or(DownloadError::InvalidMonth(month))?;
    let mut body = json!({
        "class": "ti",
        "dataset": "tigge",
        "expver": "prod",
        "origin": "ecmf",
        "grid": "0.25/0.25",
        "date": format!("{year}-{month:02}-01/to/{year}-{month:02}-{last:02}"),
        "time": "00:00:00/12:00:00",
        "param": entry.param,
        "levtype": entry.levtype,
        "type": "cf",
        "step": join_steps(360, 6),
        "target": target.display().to_string(),
    });
    if let Some(level) = entry.level {
        body["levelist"] = json!(level);
    }
    if ens {
        // Perturbed members come with a shorter step range.
        body["type"] = json!("pf");
        body["number"] = json!((1..=50)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("/"));
        body["step"] = json!(join_steps(168, 24));
    }
    Ok(body)
}

fn target_path(config: &DownloadConfig, year: i32, month: u32) -> PathBuf {
    let suffix = if config.ens { "_ens" } else { "" };
    config
        .path
        .join(&config.var)
        .join(format!("{}{}_{}_{:02}_raw.grib", config.var, suffix, year, month))
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub fetched: usize,
    pub skipped: usize,
}

/// Fetch every requested (year, month) file. Individual failures are skipped.
pub fn run_download(config: &DownloadConfig) -> Result<DownloadSummary, DownloadError> {
    let entry = catalog(&config.var)
        .ok_or_else(|| DownloadError::UnknownVariable(config.var.clone()))?;

    std::fs::create_dir_all(config.path.join(&config.var))?;
    let client = Client::builder().build()?;

    let months: Vec<(i32, u32)> = config
        .years
        .iter()
        .flat_map(|&y| (config.month_start..=config.month_end).map(move |m| (y, m)))
        .collect();
    let bar = ProgressBar::new(months.len() as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
    {
        bar.set_style(style);
    }

    let mut summary = DownloadSummary::default();
    for (year, month) in months {
        bar.set_message(format!("{}-{:02}", year, month));
        let target = target_path(config, year, month);
        match fetch_month(&client, config, &entry, year, month, &target) {
            Ok(()) => {
                info!("fetched {}", target.display());
                summary.fetched += 1;
            }
            Err(err) => {
                warn!("{}-{:02} failed, skipping: {}", year, month, err);
                summary.skipped += 1;
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(summary)
}

fn fetch_month(
    client: &Client,
    config: &DownloadConfig,
    entry: &CatalogEntry,
    year: i32,
    month: u32,
    target: &Path,
) -> Result<(), DownloadError> {
    let body = request_body(entry, year, month, config.ens, target)?;
    let mut response = client
        .post(&config.endpoint)
        .json(&body)
        .send()?
        .error_for_status()?;
    let mut file = File::create(target)?;
    response.copy_to(&mut file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_codes() {
        assert_eq!(catalog("total_precipitation").unwrap().param, "228228");
        let z = catalog("z500").unwrap();
        assert_eq!((z.param, z.levtype, z.level), ("156", "pl", Some("500")));
        let t = catalog("t850").unwrap();
        assert_eq!((t.param, t.level), ("130", Some("850")));
        assert!(catalog("vorticity").is_none());
    }

    #[test]
    fn test_step_lists() {
        assert_eq!(join_steps(24, 6), "0/6/12/18/24");
        let control = join_steps(360, 6);
        assert!(control.starts_with("0/6/") && control.ends_with("/360"));
        let ens = join_steps(168, 24);
        assert_eq!(ens, "0/24/48/72/96/120/144/168");
    }

    #[test]
    fn test_month_date_ranges() {
        assert_eq!(last_day_of_month(2015, 2), Some(28));
        assert_eq!(last_day_of_month(2016, 2), Some(29));
        assert_eq!(last_day_of_month(2016, 12), Some(31));
        assert_eq!(last_day_of_month(2016, 13), None);

        let entry = catalog("t850").unwrap();
        let body = request_body(&entry, 2016, 2, false, Path::new("/tmp/x.grib")).unwrap();
        assert_eq!(body["date"], "2016-02-01/to/2016-02-29");
        assert_eq!(body["levelist"], "850");
        assert_eq!(body["type"], "cf");
    }

    #[test]
    fn test_ensemble_request() {
        let entry = catalog("total_precipitation").unwrap();
        let body = request_body(&entry, 2017, 6, true, Path::new("/tmp/x.grib")).unwrap();
        assert_eq!(body["type"], "pf");
        assert_eq!(body["step"], "0/24/48/72/96/120/144/168");
        assert!(body["number"].as_str().unwrap().ends_with("/50"));
        assert!(body.get("levelist").is_none());
    }
}
