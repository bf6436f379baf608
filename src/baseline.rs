use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::util::{ensure_directory, sha256_hex};

pub const DEFAULT_BASELINE_URL: &str =
    "https://s3.amazonaws.com/mit-dai-delphi-datastore/best_so_far/";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("baseline unavailable for {dataset}: {reason}")]
    Unavailable { dataset: String, reason: String },

    #[error("malformed baseline {path} line {line}: {value:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("baseline for {dataset} is empty")]
    Empty { dataset: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ComparisonError {
    #[error("need at least two comparable points, got {points}")]
    InsufficientPoints { points: usize },
}

pub trait BaselineSource {
    fn fetch_baseline(&self, dataset_ref: &str) -> Result<Vec<f64>, BaselineError>;
}

/// Downloads `<base_url><dataset_ref>` once and serves later requests from
/// the local cache.
pub struct HttpBaselineSource {
    base_url: String,
    cache_dir: PathBuf,
}

impl HttpBaselineSource {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            cache_dir: cache_dir.into(),
        }
    }

    fn download(
        &self,
        dataset_ref: &str,
        destination: &Path,
    ) -> Result<Vec<f64>, BaselineError> {
        let unavailable = |reason: String| BaselineError::Unavailable {
            dataset: dataset_ref.to_string(),
            reason,
        };

        let url = format!("{}{}", self.base_url, dataset_ref);
        info!(url = %url, "downloading baseline");

        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| unavailable(format!("failed to build http client: {e}")))?;
        let response = client
            .get(&url)
            .send()
            .map_err(|e| unavailable(format!("request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "{url} returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .map_err(|e| unavailable(format!("failed to read body of {url}: {e}")))?;

        // Only a baseline that parses is allowed into the cache.
        let values = parse_baseline(destination, &String::from_utf8_lossy(&body))?;
        if values.is_empty() {
            return Err(BaselineError::Empty {
                dataset: dataset_ref.to_string(),
            });
        }

        ensure_directory(&self.cache_dir).map_err(|e| unavailable(format!("{e:#}")))?;
        let mut partial = destination.as_os_str().to_owned();
        partial.push(".tmp");
        let partial = PathBuf::from(partial);
        fs::write(&partial, &body)
            .and_then(|()| fs::rename(&partial, destination))
            .map_err(|e| {
                unavailable(format!("failed to cache {}: {e}", destination.display()))
            })?;

        debug!(
            path = %destination.display(),
            sha256 = %sha256_hex(&body),
            bytes = body.len(),
            "cached baseline"
        );
        Ok(values)
    }
}

impl BaselineSource for HttpBaselineSource {
    fn fetch_baseline(&self, dataset_ref: &str) -> Result<Vec<f64>, BaselineError> {
        let cached = self.cache_dir.join(dataset_ref);
        if cached.exists() {
            return read_baseline_file(dataset_ref, &cached);
        }
        self.download(dataset_ref, &cached)
    }
}

/// Baselines already present on disk, one file per dataset.
pub struct DirectoryBaselineSource {
    dir: PathBuf,
}

impl DirectoryBaselineSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl BaselineSource for DirectoryBaselineSource {
    fn fetch_baseline(&self, dataset_ref: &str) -> Result<Vec<f64>, BaselineError> {
        read_baseline_file(dataset_ref, &self.dir.join(dataset_ref))
    }
}

fn read_baseline_file(dataset_ref: &str, path: &Path) -> Result<Vec<f64>, BaselineError> {
    let raw = fs::read_to_string(path).map_err(|e| BaselineError::Unavailable {
        dataset: dataset_ref.to_string(),
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let values = parse_baseline(path, &raw)?;
    if values.is_empty() {
        return Err(BaselineError::Empty {
            dataset: dataset_ref.to_string(),
        });
    }
    Ok(values)
}

/// One value per line; blank lines are ignored.
pub fn parse_baseline(path: &Path, raw: &str) -> Result<Vec<f64>, BaselineError> {
    raw.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(line_number, line)| {
            line.parse::<f64>().map_err(|_| BaselineError::Malformed {
                path: path.to_path_buf(),
                line: line_number,
                value: line.to_string(),
            })
        })
        .collect()
}

/// Trapezoidal area under `y` sampled at x = 0, 1, 2, ...
pub fn trapezoid_area(y: &[f64]) -> f64 {
    y.windows(2).map(|pair| (pair[0] + pair[1]) / 2.0).sum()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AucComparison {
    pub points: usize,
    pub test_auc: f64,
    pub baseline_auc: f64,
    pub difference: f64,
}

/// Compares both curves over their common prefix.
pub fn compare_series(test: &[f64], baseline: &[f64]) -> Result<AucComparison, ComparisonError> {
    let points = test.len().min(baseline.len());
    if points < 2 {
        return Err(ComparisonError::InsufficientPoints { points });
    }

    let test_auc = trapezoid_area(&test[..points]);
    let baseline_auc = trapezoid_area(&baseline[..points]);

    Ok(AucComparison {
        points,
        test_auc,
        baseline_auc,
        difference: test_auc - baseline_auc,
    })
}
