pub mod global_variables;

#[cfg(feature = "download")]
pub mod esa_landcover;
#[cfg(feature = "download")]
pub mod geoboundaries;

use anyhow::Result;
use tracing::{error, info};

/// What happened to one fetch item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    SkippedExisting,
}

/// Per-item outcome of a fetch batch. A failed item never stops the batch.
#[derive(Debug, Default, Clone)]
pub struct FetchReport {
    pub completed: Vec<String>,
    pub skipped_existing: Vec<String>,
    /// `(item, reason)`
    pub failed: Vec<(String, String)>,
}

impl FetchReport {
    pub fn record(&mut self, item: String, outcome: Result<ItemOutcome>) {
        match outcome {
            Ok(ItemOutcome::Completed) => self.completed.push(item),
            Ok(ItemOutcome::SkippedExisting) => self.skipped_existing.push(item),
            Err(e) => {
                error!(item = %item, "{:#}", e);
                self.failed.push((item, format!("{:#}", e)));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log_summary(&self, batch: &str) {
        info!(
            batch,
            completed = self.completed.len(),
            skipped = self.skipped_existing.len(),
            failed = self.failed.len(),
            "fetch finished"
        );
    }
}

#[cfg(feature = "indicatif")]
pub(crate) fn progress_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("##-")
}
