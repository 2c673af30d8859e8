use crate::nn::Activation;
use clap::ArgMatches;
use std::path::PathBuf;

/// One entry of the variable specification, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub enum VarSpecEntry {
    /// A named variable, optionally restricted to pressure levels.
    Var {
        name: String,
        levels: Option<Vec<i32>>,
    },
    /// Time-invariant fields (orography, land-sea mask, ...).
    Constants(Vec<String>),
}

/// Ordered variable specification.
///
/// Compact CLI syntax: entries separated by commas, levels by slashes, e.g.
/// `z:500/850,t:850,u10,constants:orography/lsm`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarSpec {
    pub entries: Vec<VarSpecEntry>,
}

impl VarSpec {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err("empty entry in variable specification".to_string());
            }
            match part.split_once(':') {
                Some(("constants", names)) => {
                    let names: Vec<String> = names
                        .split('/')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if names.is_empty() {
                        return Err("constants entry lists no fields".to_string());
                    }
                    entries.push(VarSpecEntry::Constants(names));
                }
                Some((name, levels)) => {
                    let levels = levels
                        .split('/')
                        .map(|l| {
                            l.trim()
                                .parse::<i32>()
                                .map_err(|_| format!("invalid level '{}' for '{}'", l, name))
                        })
                        .collect::<Result<Vec<i32>, String>>()?;
                    if levels.is_empty() {
                        return Err(format!("no levels given for '{}'", name));
                    }
                    entries.push(VarSpecEntry::Var {
                        name: name.trim().to_string(),
                        levels: Some(levels),
                    });
                }
                None => entries.push(VarSpecEntry::Var {
                    name: part.to_string(),
                    levels: None,
                }),
            }
        }
        if entries.is_empty() {
            return Err("variable specification is empty".to_string());
        }
        Ok(Self { entries })
    }

    /// Every variable name to load from the data directory, in order.
    pub fn data_var_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for entry in &self.entries {
            match entry {
                VarSpecEntry::Var { name, .. } => names.push(name.clone()),
                VarSpecEntry::Constants(cs) => names.extend(cs.iter().cloned()),
            }
        }
        names
    }
}

/// Inclusive year range, parsed from `start:end`.
pub fn parse_year_range(s: &str) -> Result<(i32, i32), String> {
    let (a, b) = s
        .split_once(':')
        .ok_or_else(|| format!("expected start:end year range, got '{}'", s))?;
    let start: i32 = a
        .trim()
        .parse()
        .map_err(|_| format!("invalid year '{}'", a))?;
    let end: i32 = b.trim().parse().map_err(|_| format!("invalid year '{}'", b))?;
    if end < start {
        return Err(format!("year range '{}' ends before it starts", s));
    }
    Ok((start, end))
}

fn parse_usize_list(s: &str, what: &str) -> Result<Vec<usize>, String> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid {} value '{}'", what, v))
        })
        .collect()
}

/// Configuration for the training/evaluation driver.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Directory holding one subdirectory of container files per variable.
    pub datadir: PathBuf,
    /// Destination for the trained weight snapshot.
    pub model_path: PathBuf,
    /// Destination for the prediction file.
    pub pred_path: PathBuf,
    pub var_spec: VarSpec,
    /// Anchored patterns selecting output level slots; `None` keeps all.
    pub output_vars: Option<Vec<String>>,
    /// Output channels per layer; the last entry is the network output width.
    pub filters: Vec<usize>,
    /// Square kernel size per layer.
    pub kernels: Vec<usize>,
    /// Forecast lead time in timesteps.
    pub lead_time: usize,
    pub learning_rate: f32,
    pub activation: Activation,
    pub dropout: f32,
    pub batch_size: usize,
    /// Early-stopping patience in epochs.
    pub patience: usize,
    pub max_epochs: usize,
    pub train_years: (i32, i32),
    pub valid_years: (i32, i32),
    pub test_years: (i32, i32),
    pub seed: u64,
}

impl TrainConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let var_spec = VarSpec::parse(matches.get_one::<String>("var-spec").unwrap())?;
        let output_vars = matches
            .get_many::<String>("output-vars")
            .map(|vs| vs.cloned().collect::<Vec<_>>());
        let activation: Activation = matches
            .get_one::<String>("activation")
            .unwrap()
            .parse()
            .map_err(|e: String| e)?;

        let config = Self {
            datadir: PathBuf::from(matches.get_one::<String>("datadir").unwrap()),
            model_path: PathBuf::from(matches.get_one::<String>("model-path").unwrap()),
            pred_path: PathBuf::from(matches.get_one::<String>("pred-path").unwrap()),
            var_spec,
            output_vars,
            filters: parse_usize_list(matches.get_one::<String>("filters").unwrap(), "filter")?,
            kernels: parse_usize_list(matches.get_one::<String>("kernels").unwrap(), "kernel")?,
            lead_time: *matches.get_one::<usize>("lead-time").unwrap(),
            learning_rate: *matches.get_one::<f32>("learning-rate").unwrap(),
            activation,
            dropout: *matches.get_one::<f32>("dropout").unwrap(),
            batch_size: *matches.get_one::<usize>("batch-size").unwrap(),
            patience: *matches.get_one::<usize>("patience").unwrap(),
            max_epochs: *matches.get_one::<usize>("max-epochs").unwrap(),
            train_years: parse_year_range(matches.get_one::<String>("train-years").unwrap())?,
            valid_years: parse_year_range(matches.get_one::<String>("valid-years").unwrap())?,
            test_years: parse_year_range(matches.get_one::<String>("test-years").unwrap())?,
            seed: *matches.get_one::<u64>("seed").unwrap(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.filters.is_empty() {
            return Err("at least one layer is required".to_string());
        }
        if self.filters.len() != self.kernels.len() {
            return Err(format!(
                "requires the same number of filters and kernel sizes ({} vs {})",
                self.filters.len(),
                self.kernels.len()
            ));
        }
        if self.lead_time == 0 {
            return Err("lead time must be at least one timestep".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err("dropout rate must be in [0, 1)".to_string());
        }
        if self.learning_rate <= 0.0 {
            return Err("learning rate must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration for the archive retrieval client.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub var: String,
    pub years: Vec<i32>,
    pub month_start: u32,
    pub month_end: u32,
    pub path: PathBuf,
    /// Request perturbed ensemble members instead of the control forecast.
    pub ens: bool,
    pub endpoint: String,
}

impl DownloadConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let years = matches
            .get_one::<String>("years")
            .unwrap()
            .split(',')
            .map(|y| {
                y.trim()
                    .parse::<i32>()
                    .map_err(|_| format!("invalid year '{}'", y))
            })
            .collect::<Result<Vec<i32>, String>>()?;
        let config = Self {
            var: matches.get_one::<String>("variable").unwrap().clone(),
            years,
            month_start: *matches.get_one::<u32>("month-start").unwrap(),
            month_end: *matches.get_one::<u32>("month-end").unwrap(),
            path: PathBuf::from(matches.get_one::<String>("path").unwrap()),
            ens: matches.get_flag("ens"),
            endpoint: matches.get_one::<String>("endpoint").unwrap().clone(),
        };
        if config.month_start == 0 || config.month_end > 12 || config.month_start > config.month_end
        {
            return Err("months must satisfy 1 <= start <= end <= 12".to_string());
        }
        if config.years.is_empty() {
            return Err("no years requested".to_string());
        }
        Ok(config)
    }
}

/// Configuration for the array container builder.
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub deaccumulate: bool,
    pub scale: f32,
}

impl PackConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let inputs: Vec<PathBuf> = matches
            .get_many::<String>("inputs")
            .unwrap()
            .map(PathBuf::from)
            .collect();
        Ok(Self {
            inputs,
            output: PathBuf::from(matches.get_one::<String>("output").unwrap()),
            deaccumulate: matches.get_flag("deaccumulate"),
            scale: *matches.get_one::<f32>("scale").unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_spec_parse_mixed() {
        let spec = VarSpec::parse("z:500/850,t:850,u10,constants:orography/lsm").unwrap();
        assert_eq!(spec.entries.len(), 4);
        assert_eq!(
            spec.entries[0],
            VarSpecEntry::Var {
                name: "z".to_string(),
                levels: Some(vec![500, 850]),
            }
        );
        assert_eq!(
            spec.entries[2],
            VarSpecEntry::Var {
                name: "u10".to_string(),
                levels: None,
            }
        );
        assert_eq!(
            spec.entries[3],
            VarSpecEntry::Constants(vec!["orography".to_string(), "lsm".to_string()])
        );
        assert_eq!(
            spec.data_var_names(),
            vec!["z", "t", "u10", "orography", "lsm"]
        );
    }

    #[test]
    fn test_var_spec_rejects_bad_level() {
        assert!(VarSpec::parse("z:500/mid").is_err());
        assert!(VarSpec::parse("").is_err());
    }

    #[test]
    fn test_year_range_parse() {
        assert_eq!(parse_year_range("1979:2015").unwrap(), (1979, 2015));
        assert_eq!(parse_year_range("2016:2016").unwrap(), (2016, 2016));
        assert!(parse_year_range("2017:2015").is_err());
        assert!(parse_year_range("2015").is_err());
    }

    #[test]
    fn test_train_config_validate() {
        let mut config = TrainConfig {
            datadir: PathBuf::from("."),
            model_path: PathBuf::from("weights.npz"),
            pred_path: PathBuf::from("preds.npz"),
            var_spec: VarSpec::parse("z:500").unwrap(),
            output_vars: None,
            filters: vec![32, 1],
            kernels: vec![5, 5],
            lead_time: 6,
            learning_rate: 1e-4,
            activation: Activation::Elu,
            dropout: 0.0,
            batch_size: 32,
            patience: 3,
            max_epochs: 100,
            train_years: (1979, 2015),
            valid_years: (2016, 2016),
            test_years: (2017, 2018),
            seed: 0,
        };
        assert!(config.validate().is_ok());

        config.kernels = vec![5];
        assert!(config.validate().is_err());
        config.kernels = vec![5, 5];
        config.lead_time = 0;
        assert!(config.validate().is_err());
    }
}
