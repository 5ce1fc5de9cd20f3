use extrato_core::{DocumentClassification, ParsedDraftTransaction};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowIssueKind {
    EmptyLine,
    InvalidDate,
    InvalidAmount,
    MissingField,
}

impl RowIssueKind {
    /// Ignorable rows are counted separately from errors and need no user action.
    pub fn is_ignorable(self) -> bool {
        matches!(self, RowIssueKind::EmptyLine)
    }
}

impl fmt::Display for RowIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowIssueKind::EmptyLine => write!(f, "empty_line"),
            RowIssueKind::InvalidDate => write!(f, "invalid_date"),
            RowIssueKind::InvalidAmount => write!(f, "invalid_amount"),
            RowIssueKind::MissingField => write!(f, "missing_field"),
        }
    }
}

/// A statement line a parser could not turn into a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub line: usize,
    pub kind: RowIssueKind,
    pub message: String,
}

impl RowIssue {
    pub fn new(line: usize, kind: RowIssueKind, message: impl Into<String>) -> Self {
        Self {
            line,
            kind,
            message: message.into(),
        }
    }
}

/// Uniform output of every format parser.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub classification: DocumentClassification,
    pub drafts: Vec<ParsedDraftTransaction>,
    pub issues: Vec<RowIssue>,
    /// Account number as printed in the document (OFX `ACCTID`, PDF header).
    pub account_number: Option<String>,
    /// Confidence of the column mapping, for formats that need one.
    pub mapping_confidence: Option<f32>,
}

impl ParsedDocument {
    pub fn total_rows(&self) -> usize {
        self.drafts.len() + self.issues.len()
    }
}

/// Negate every draft of a credit card invoice whose charges are written as
/// positive numbers. Returns whether the signs were flipped.
///
/// Issuers disagree: some export charges as positive values with payments
/// negative, others already use the debit-negative convention. The majority
/// sign decides.
pub fn apply_invoice_sign_convention(
    drafts: &mut [ParsedDraftTransaction],
    classification: &DocumentClassification,
) -> bool {
    if !classification.is_invoice() {
        return false;
    }

    let positives = drafts.iter().filter(|d| d.amount.is_positive()).count();
    let negatives = drafts.iter().filter(|d| d.amount.is_negative()).count();
    if positives <= negatives {
        return false;
    }

    for draft in drafts.iter_mut() {
        draft.amount = -draft.amount;
    }
    true
}
