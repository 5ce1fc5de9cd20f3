use serde::{Deserialize, Serialize};

/// Aggregate counters for one import run.
///
/// Every parsed row lands in exactly one of `ignored_rows`, `error_rows`,
/// `invalid_rows`, `imported`, `skipped` or `duplicates`; `valid_rows` is the
/// sum of the last three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCommitReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub ignored_rows: usize,
    pub error_rows: usize,
    pub imported: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub invalid_rows: usize,
    pub transfer_created: usize,
    pub card_payment_detected: usize,
    pub card_payment_not_converted: usize,
}

impl ImportCommitReport {
    /// Checks the partition invariant described on the type.
    pub fn is_balanced(&self) -> bool {
        self.valid_rows == self.imported + self.skipped + self.duplicates
            && self.total_rows
                == self.ignored_rows + self.error_rows + self.invalid_rows + self.valid_rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Imported,
    Duplicate,
    Skipped,
    Ignored,
    Error,
    Invalid,
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowStatus::Imported => write!(f, "imported"),
            RowStatus::Duplicate => write!(f, "duplicate"),
            RowStatus::Skipped => write!(f, "skipped"),
            RowStatus::Ignored => write!(f, "ignored"),
            RowStatus::Error => write!(f, "error"),
            RowStatus::Invalid => write!(f, "invalid"),
        }
    }
}

/// Per-row result surfaced to the user for correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub line: usize,
    pub status: RowStatus,
    pub message: Option<String>,
}

impl RowOutcome {
    pub fn new(line: usize, status: RowStatus) -> Self {
        Self { line, status, message: None }
    }

    pub fn with_message(line: usize, status: RowStatus, message: impl Into<String>) -> Self {
        Self {
            line,
            status,
            message: Some(message.into()),
        }
    }
}
