use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::collect::global_variables::CDS_LANDCOVER_DATASET;
use crate::collect::{FetchReport, ItemOutcome};
use crate::commons::basic_functions::ensure_parent_dir;
use crate::config::Config;
use crate::geometric::reclassify::ReclassTable;

/// CDS version of the ESA CCI product for a year, and whether it is a guess
pub fn cds_version(year: i32) -> (&'static str, bool) {
    match year {
        1992..=2015 => ("v2_0_7cds", false),
        2016..=2021 => ("v2_1_1", false),
        _ => ("v2_1_1", true),
    }
}

/// Body of a CDS retrieve request for one year
pub fn retrieve_request(year: i32) -> serde_json::Value {
    let (version, _) = cds_version(year);
    json!({
        "inputs": {
            "variable": "all",
            "format": "zip",
            "version": [version],
            "year": [year.to_string()],
        }
    })
}

#[derive(Debug, Deserialize)]
struct JobInfo {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobResults {
    asset: Asset,
}

#[derive(Debug, Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
}

/// Pick the single NetCDF member of a CDS archive
pub fn select_netcdf_member<'a, I>(names: I, year: i32) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let members: Vec<&str> = names.into_iter().filter(|n| n.ends_with(".nc")).collect();
    match members.as_slice() {
        [single] => Ok(single.to_string()),
        _ => anyhow::bail!(
            "Multiple or no ({}) NetCDF files found in zip for {}",
            members.len(),
            year
        ),
    }
}

/// Extract the NetCDF member of `zip_path` into `out_dir`
pub fn extract_netcdf(zip_path: &Path, out_dir: &Path, year: i32, overwrite: bool) -> Result<PathBuf> {
    info!(path = %zip_path.display(), "unzipping");
    let file = File::open(zip_path)
        .with_context(|| format!("Failed to open archive: {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Invalid zip archive: {}", zip_path.display()))?;

    let member = select_netcdf_member(archive.file_names(), year)?;
    let mut entry = archive.by_name(&member)?;
    let relative = entry
        .enclosed_name()
        .map(Path::to_path_buf)
        .with_context(|| format!("Unsafe member path in archive: {}", member))?;
    let output_path = out_dir.join(relative);

    if output_path.is_file() && !overwrite {
        info!(path = %output_path.display(), "unzip exists");
        return Ok(output_path);
    }
    ensure_parent_dir(&output_path)?;
    let mut out = File::create(&output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    std::io::copy(&mut entry, &mut out)
        .with_context(|| format!("Failed to extract {}", member))?;
    info!(path = %output_path.display(), "unzip complete");
    Ok(output_path)
}

/// ESA CCI land-cover download and reclassification, one GeoTIFF per year
pub struct EsaLandcover {
    raw_dir: PathBuf,
    process_dir: PathBuf,
    years: Vec<i32>,
    outputs: Vec<PathBuf>,
    api_key: String,
    cds_url: String,
    poll_interval: Duration,
    max_wait: Duration,
    overwrite_download: bool,
    overwrite_processing: bool,
    table: ReclassTable,
    client: Client,
}

impl EsaLandcover {
    pub fn new(config: &Config) -> Result<Self> {
        let lc = &config.landcover;
        let api_key = std::env::var(&lc.api_key_env_var)
            .with_context(|| format!("Environment variable {} is not set", lc.api_key_env_var))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(3600))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(EsaLandcover {
            raw_dir: config.landcover_raw_dir(),
            process_dir: config.landcover_process_dir(),
            years: lc.years.clone(),
            outputs: lc.years.iter().map(|&y| config.raster_path(y)).collect(),
            api_key,
            cds_url: lc.cds_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(lc.poll_interval_secs.max(1)),
            max_wait: Duration::from_secs(lc.max_wait_secs),
            overwrite_download: lc.overwrite_download,
            overwrite_processing: lc.overwrite_processing,
            table: config.reclass_table()?,
            client,
        })
    }

    /// Download and process every configured year; a failing year does not
    /// stop the others.
    pub fn run(&self) -> Result<FetchReport> {
        for dir in [
            self.raw_dir.join("compressed"),
            self.raw_dir.join("uncompressed"),
            self.process_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        if self.overwrite_download && !self.overwrite_processing {
            warn!("overwrite_download is set but not overwrite_processing");
        }

        let mut report = FetchReport::default();
        for (&year, output) in self.years.iter().zip(&self.outputs) {
            let outcome = self
                .download(year)
                .and_then(|nc_path| self.process(&nc_path, output));
            report.record(format!("esa_lc_{}", year), outcome);
        }
        report.log_summary("ESA land cover");
        Ok(report)
    }

    /// Fetch the archive for `year` and extract its NetCDF file
    pub fn download(&self, year: i32) -> Result<PathBuf> {
        let (version, assumed) = cds_version(year);
        if assumed {
            warn!(year, version, "assuming CDS product version");
        }

        let dl_path = self.raw_dir.join("compressed").join(format!("{}.zip", year));
        if !dl_path.exists() || self.overwrite_download {
            self.retrieve(year, &dl_path)?;
        } else {
            debug!(path = %dl_path.display(), "archive already downloaded");
        }
        extract_netcdf(
            &dl_path,
            &self.raw_dir.join("uncompressed"),
            year,
            self.overwrite_download,
        )
    }

    fn execution_url(&self) -> String {
        format!(
            "{}/retrieve/v1/processes/{}/execution",
            self.cds_url, CDS_LANDCOVER_DATASET
        )
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/retrieve/v1/jobs/{}", self.cds_url, job_id)
    }

    /// Submit a CDS job, wait for it and download its result to `dl_path`
    fn retrieve(&self, year: i32, dl_path: &Path) -> Result<()> {
        info!(year, url = %self.execution_url(), "submitting CDS request");
        let response = self
            .client
            .post(self.execution_url())
            .header("PRIVATE-TOKEN", &self.api_key)
            .json(&retrieve_request(year))
            .send()
            .context("Failed to submit CDS request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("CDS API returned error {}: {}", status, body);
        }
        let mut job: JobInfo = response.json().context("Unexpected CDS job response")?;

        let started = Instant::now();
        loop {
            debug!(job = %job.job_id, status = %job.status, "CDS job status");
            match job.status.as_str() {
                "successful" => break,
                "failed" | "dismissed" => {
                    anyhow::bail!("CDS job {} ended as {}", job.job_id, job.status)
                }
                _ => {}
            }
            anyhow::ensure!(
                started.elapsed() < self.max_wait,
                "CDS job {} still {} after {:?}",
                job.job_id,
                job.status,
                self.max_wait
            );
            std::thread::sleep(self.poll_interval);
            job = self
                .client
                .get(self.job_url(&job.job_id))
                .header("PRIVATE-TOKEN", &self.api_key)
                .send()
                .and_then(|r| r.error_for_status())
                .context("Failed to poll CDS job")?
                .json()
                .context("Unexpected CDS job status response")?;
        }

        let results: JobResults = self
            .client
            .get(format!("{}/results", self.job_url(&job.job_id)))
            .header("PRIVATE-TOKEN", &self.api_key)
            .send()
            .and_then(|r| r.error_for_status())
            .context("Failed to fetch CDS job results")?
            .json()
            .context("Unexpected CDS results response")?;

        info!(year, href = %results.asset.value.href, "downloading land cover archive");
        let mut response = self
            .client
            .get(&results.asset.value.href)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to download {}", results.asset.value.href))?;

        let parent = dl_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        response
            .copy_to(tmp.as_file_mut())
            .context("Failed to write archive")?;
        tmp.persist(dl_path)
            .with_context(|| format!("Failed to save archive to {}", dl_path.display()))?;
        Ok(())
    }

    /// Reclassify a NetCDF file into `output_path`, via the processing dir
    pub fn process(&self, nc_path: &Path, output_path: &Path) -> Result<ItemOutcome> {
        if output_path.exists() && !self.overwrite_processing {
            info!(path = %output_path.display(), "processed layer exists");
            return Ok(ItemOutcome::SkippedExisting);
        }
        info!(path = %nc_path.display(), "processing");
        self.reclassify(nc_path, output_path)?;
        Ok(ItemOutcome::Completed)
    }

    #[cfg(feature = "gdal")]
    fn reclassify(&self, nc_path: &Path, output_path: &Path) -> Result<()> {
        let file_name = output_path
            .file_name()
            .with_context(|| format!("No file name in {}", output_path.display()))?;
        let tmp_output = self.process_dir.join(file_name);
        crate::geometric::reclassify::reclassify_netcdf(nc_path, &tmp_output, &self.table)?;

        ensure_parent_dir(output_path)?;
        info!(from = %tmp_output.display(), to = %output_path.display(), "copying output to final location");
        std::fs::copy(&tmp_output, output_path)
            .with_context(|| format!("Failed to copy {}", tmp_output.display()))?;
        Ok(())
    }

    #[cfg(not(feature = "gdal"))]
    fn reclassify(&self, nc_path: &Path, _output_path: &Path) -> Result<()> {
        debug!(entries = self.table.len(), "reclass table loaded");
        anyhow::bail!(
            "Cannot reclassify {}: built without the `gdal` feature",
            nc_path.display()
        )
    }
}
