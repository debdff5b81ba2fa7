//! Validation result models and the exported run summary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::errors::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Failed,
    Timeout,
    Error,
}

impl ValidationStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Success => write!(f, "success"),
            ValidationStatus::Failed => write!(f, "failed"),
            ValidationStatus::Timeout => write!(f, "timeout"),
            ValidationStatus::Error => write!(f, "error"),
        }
    }
}

/// Verdict for a single probed source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub channel_id: String,
    pub channel_name: String,
    pub url: String,
    pub status: ValidationStatus,
    pub error_detail: Option<String>,
    pub elapsed_millis: Option<u64>,
    pub tested_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// JSON document summarizing a validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub tested_at: DateTime<Utc>,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn from_results(results: &[ValidationResult]) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        Self {
            tested_at: Utc::now(),
            total: results.len(),
            success_count,
            failed_count: results.len() - success_count,
            results: results.to_vec(),
        }
    }

    /// Default export file name, e.g. `stream-validation-2024-05-01.json`
    pub fn default_file_name(&self) -> String {
        format!(
            "stream-validation-{}.json",
            self.tested_at.format("%Y-%m-%d")
        )
    }

    pub fn to_json_pretty(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn write_to(&self, path: &Path) -> AppResult<()> {
        let contents = self.to_json_pretty()?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}
