use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use gridcast::config::{DownloadConfig, PackConfig, TrainConfig};
use gridcast::data_io::packer::{pack_variable, PackOptions};
use gridcast::download::run_download;
use gridcast::training::run_training;

fn main() {
    env_logger::init();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("download", sub_matches)) => {
            if let Err(e) = run_download_cmd(sub_matches) {
                eprintln!("Download error: {}", e);
                std::process::exit(1);
            }
        }
        Some(("pack", sub_matches)) => {
            if let Err(e) = run_pack_cmd(sub_matches) {
                eprintln!("Pack error: {}", e);
                std::process::exit(1);
            }
        }
        Some(("train", sub_matches)) => {
            if let Err(e) = run_train_cmd(sub_matches) {
                eprintln!("Training error: {}", e);
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("Please specify a subcommand. Use --help for more information.");
            std::process::exit(1);
        }
    }
}

fn run_download_cmd(matches: &ArgMatches) -> Result<(), String> {
    let config = DownloadConfig::from_matches(matches)?;
    let summary = run_download(&config).map_err(|e| e.to_string())?;
    println!(
        "Fetched {} month(s), skipped {}",
        summary.fetched, summary.skipped
    );
    Ok(())
}

fn run_pack_cmd(matches: &ArgMatches) -> Result<(), String> {
    let config = PackConfig::from_matches(matches)?;
    let options = PackOptions {
        deaccumulate: config.deaccumulate,
        scale: config.scale,
    };
    let summary =
        pack_variable(&config.inputs, &config.output, &options).map_err(|e| e.to_string())?;
    println!(
        "Packed {} chunk(s), {} timesteps total",
        summary.chunks, summary.total_timesteps
    );
    Ok(())
}

fn run_train_cmd(matches: &ArgMatches) -> Result<(), String> {
    let config = TrainConfig::from_matches(matches)?;
    let scores = run_training(&config).map_err(|e| e.to_string())?;
    if scores.is_empty() {
        println!("No archived truth found for verification");
    } else {
        println!("\n=== Test-set latitude-weighted RMSE ===");
        for score in &scores {
            println!("{:12} {:.4}", score.name, score.rmse);
        }
    }
    Ok(())
}

fn build_cli() -> Command {
    Command::new("gridcast")
        .version("0.1.0")
        .about("Download, pack and learn from gridded weather reanalysis data")
        .subcommand_required(true)
        .subcommand(
            Command::new("download")
                .about("Fetch monthly archive files for one variable")
                .arg(
                    Arg::new("variable")
                        .short('v')
                        .long("variable")
                        .value_name("NAME")
                        .help("Catalog variable, e.g. z500, t850, total_precipitation")
                        .required(true),
                )
                .arg(
                    Arg::new("years")
                        .long("years")
                        .value_name("YEARS")
                        .help("Comma-separated list of years to fetch")
                        .required(true),
                )
                .arg(
                    Arg::new("month-start")
                        .long("month-start")
                        .value_name("MONTH")
                        .help("First month to fetch")
                        .default_value("1")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("month-end")
                        .long("month-end")
                        .value_name("MONTH")
                        .help("Last month to fetch")
                        .default_value("12")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .value_name("DIR")
                        .help("Directory receiving one subdirectory per variable")
                        .default_value("./data"),
                )
                .arg(
                    Arg::new("ens")
                        .long("ens")
                        .help("Fetch perturbed ensemble members instead of the control run")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .value_name("URL")
                        .help("Archive request endpoint")
                        .default_value("https://api.ecmwf.int/v1/services/tigge/requests"),
                ),
        )
        .subcommand(
            Command::new("pack")
                .about("Flatten monthly chunk files into one dense container")
                .arg(
                    Arg::new("inputs")
                        .short('i')
                        .long("inputs")
                        .value_name("FILES")
                        .help("Chunk files in time order (.npz, or .nc with the netcdf feature)")
                        .num_args(1..)
                        .required(true),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Destination container (.npz)")
                        .required(true),
                )
                .arg(
                    Arg::new("deaccumulate")
                        .long("deaccumulate")
                        .help("First-difference accumulated fields along time")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("scale")
                        .long("scale")
                        .value_name("FACTOR")
                        .help("Unit scale applied before de-accumulation")
                        .default_value("1.0")
                        .value_parser(value_parser!(f32)),
                ),
        )
        .subcommand(
            Command::new("train")
                .about("Train a periodic CNN and write verified forecasts")
                .arg(
                    Arg::new("datadir")
                        .short('d')
                        .long("datadir")
                        .value_name("DIR")
                        .help("Directory with one container subdirectory per variable")
                        .required(true),
                )
                .arg(
                    Arg::new("model-path")
                        .long("model-path")
                        .value_name("FILE")
                        .help("Destination for the weight snapshot (.npz)")
                        .required(true),
                )
                .arg(
                    Arg::new("pred-path")
                        .long("pred-path")
                        .value_name("FILE")
                        .help("Destination for the forecast file (.npz)")
                        .required(true),
                )
                .arg(
                    Arg::new("var-spec")
                        .long("var-spec")
                        .value_name("SPEC")
                        .help("Input channels, e.g. z:500/850,t:850,constants:orography")
                        .required(true),
                )
                .arg(
                    Arg::new("output-vars")
                        .long("output-vars")
                        .value_name("PATTERN")
                        .help("Anchored patterns selecting output channels (default: all)")
                        .num_args(1..),
                )
                .arg(
                    Arg::new("filters")
                        .long("filters")
                        .value_name("LIST")
                        .help("Comma-separated output width per layer")
                        .default_value("64,64,64,64,2"),
                )
                .arg(
                    Arg::new("kernels")
                        .long("kernels")
                        .value_name("LIST")
                        .help("Comma-separated odd kernel size per layer")
                        .default_value("5,5,5,5,5"),
                )
                .arg(
                    Arg::new("lead-time")
                        .long("lead-time")
                        .value_name("STEPS")
                        .help("Forecast lead time in timesteps")
                        .default_value("12")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("learning-rate")
                        .long("learning-rate")
                        .value_name("LR")
                        .default_value("1e-4")
                        .value_parser(value_parser!(f32)),
                )
                .arg(
                    Arg::new("activation")
                        .long("activation")
                        .value_name("NAME")
                        .help("Hidden-layer activation: linear, relu, leakyrelu, elu, tanh")
                        .default_value("elu"),
                )
                .arg(
                    Arg::new("dropout")
                        .long("dropout")
                        .value_name("RATE")
                        .default_value("0.0")
                        .value_parser(value_parser!(f32)),
                )
                .arg(
                    Arg::new("batch-size")
                        .long("batch-size")
                        .value_name("N")
                        .default_value("32")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("patience")
                        .long("patience")
                        .value_name("EPOCHS")
                        .help("Early-stopping patience on the validation loss")
                        .default_value("3")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("max-epochs")
                        .long("max-epochs")
                        .value_name("N")
                        .default_value("100")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("train-years")
                        .long("train-years")
                        .value_name("START:END")
                        .default_value("1979:2015"),
                )
                .arg(
                    Arg::new("valid-years")
                        .long("valid-years")
                        .value_name("START:END")
                        .default_value("2016:2016"),
                )
                .arg(
                    Arg::new("test-years")
                        .long("test-years")
                        .value_name("START:END")
                        .default_value("2017:2018"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("SEED")
                        .default_value("0")
                        .value_parser(value_parser!(u64)),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_train_subcommand_parses() {
        let matches = build_cli()
            .try_get_matches_from([
                "gridcast",
                "train",
                "--datadir",
                "./data",
                "--model-path",
                "weights.npz",
                "--pred-path",
                "preds.npz",
                "--var-spec",
                "z:500,t:850",
                "--output-vars",
                "z_500",
                "t_850",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "train");
        let config = TrainConfig::from_matches(sub).unwrap();
        assert_eq!(config.lead_time, 12);
        assert_eq!(config.filters, vec![64, 64, 64, 64, 2]);
        assert_eq!(
            config.output_vars,
            Some(vec!["z_500".to_string(), "t_850".to_string()])
        );
    }
}
