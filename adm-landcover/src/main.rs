use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use adm_landcover::collect::global_variables::DEFAULT_CONFIG_PATH;
use adm_landcover::commons::basic_functions::init_logging;
use adm_landcover::integrate::pipeline;
use adm_landcover::Config;

#[derive(Parser)]
#[command(name = "adm-landcover")]
#[command(version, about = "Administrative boundaries, ESA land cover and treatment data integration", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download geoBoundaries polygons and their metadata
    Boundary,
    /// Download and reclassify ESA CCI land cover
    Landcover,
    /// Resolve overlaps, merge treatment, compute zonal statistics and export
    Integrate,
}

#[cfg(feature = "download")]
fn run_boundary(config: &Config) -> Result<()> {
    let report = adm_landcover::collect::geoboundaries::GeoBoundaries::new(config)?.run()?;
    anyhow::ensure!(report.is_success(), "{} boundary download(s) failed", report.failed.len());
    Ok(())
}

#[cfg(feature = "download")]
fn run_landcover(config: &Config) -> Result<()> {
    let report = adm_landcover::collect::esa_landcover::EsaLandcover::new(config)?.run()?;
    anyhow::ensure!(report.is_success(), "{} land cover year(s) failed", report.failed.len());
    Ok(())
}

#[cfg(not(feature = "download"))]
fn run_boundary(_config: &Config) -> Result<()> {
    anyhow::bail!("built without the `download` feature")
}

#[cfg(not(feature = "download"))]
fn run_landcover(_config: &Config) -> Result<()> {
    anyhow::bail!("built without the `download` feature")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info", cli.log_file.as_deref())?;

    let config = Config::load(&cli.config)?;
    let result = match cli.command {
        Commands::Boundary => run_boundary(&config),
        Commands::Landcover => run_landcover(&config),
        Commands::Integrate => pipeline::run(&config).map(|summary| {
            info!(
                csv = %summary.csv_path.display(),
                geojson = %summary.geojson_path.display(),
                "outputs written"
            );
        }),
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
