//! Plan output parsing

use crate::error::{CloudError, Result};
use serde::Deserialize;

/// Counts from the plan's `change_summary` record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ChangeSummary {
    #[serde(default)]
    pub add: u64,
    #[serde(default)]
    pub change: u64,
    #[serde(default)]
    pub remove: u64,
}

#[derive(Deserialize)]
struct SummaryRecord {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    changes: Option<ChangeSummary>,
}

/// What a plan says about the managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanResult {
    pub exists: bool,
    pub up_to_date: bool,
}

impl From<ChangeSummary> for PlanResult {
    fn from(summary: ChangeSummary) -> Self {
        Self {
            exists: summary.add == 0,
            up_to_date: summary.change == 0,
        }
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.remove
        )
    }
}

/// Find the `change_summary` record in line-oriented JSON plan output
///
/// Lines that are not JSON, or JSON of another type, are skipped. No
/// record at all means the tool speaks a format this crate does not
/// understand.
pub fn parse_change_summary(output: &str) -> Result<ChangeSummary> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with('{'))
        .filter_map(|line| serde_json::from_str::<SummaryRecord>(line).ok())
        .find(|record| record.record_type == "change_summary")
        .and_then(|record| record.changes)
        .ok_or(CloudError::NoPlanSummaryFound)
}
