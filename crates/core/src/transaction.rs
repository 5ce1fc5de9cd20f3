use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::account::{AccountId, CategoryId, UserId};
use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Csv,
    Ofx,
    Pdf,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Csv => "csv",
            SourceType::Ofx => "ofx",
            SourceType::Pdf => "pdf",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(SourceType::Csv),
            "ofx" | "qfx" => Ok(SourceType::Ofx),
            "pdf" => Ok(SourceType::Pdf),
            other => Err(format!("Unknown source type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    BankStatement,
    CreditCardInvoice,
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentType::BankStatement => write!(f, "bank_statement"),
            DocumentType::CreditCardInvoice => write!(f, "credit_card_invoice"),
        }
    }
}

/// What kind of document was parsed and who issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentClassification {
    pub document_type: DocumentType,
    pub issuer_profile: String,
    /// 0.0 = pure fallback, 1.0 = strong keyword evidence.
    pub confidence: f32,
}

impl DocumentClassification {
    pub const UNKNOWN_ISSUER: &'static str = "unknown";

    pub fn new(document_type: DocumentType, issuer_profile: impl Into<String>, confidence: f32) -> Self {
        Self {
            document_type,
            issuer_profile: issuer_profile.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn unknown(document_type: DocumentType) -> Self {
        Self::new(document_type, Self::UNKNOWN_ISSUER, 0.0)
    }

    pub fn is_invoice(&self) -> bool {
        self.document_type == DocumentType::CreditCardInvoice
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    pub fn from_amount(amount: Money) -> Self {
        if amount.is_negative() {
            TransactionKind::Expense
        } else {
            TransactionKind::Income
        }
    }
}

/// One statement line as read by a format parser, before dedupe and categorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDraftTransaction {
    /// 1-based position in the source document (line for CSV/PDF, block for OFX).
    pub line: usize,
    pub date: NaiveDate,
    pub description: String,
    pub normalized_description: String,
    pub amount: Money,
    pub external_id: Option<String>,
    /// Free-text account label read from the document, if the format carries one.
    pub account_label: Option<String>,
    pub raw: BTreeMap<String, String>,
}

impl ParsedDraftTransaction {
    pub fn kind(&self) -> TransactionKind {
        TransactionKind::from_amount(self.amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallmentInfo {
    pub current_installment: u32,
    pub total_installments: u32,
    pub remaining_installments: u32,
    /// `"{current}/{total}"` without leading zeros.
    pub marker: String,
    pub base_description: String,
    pub normalized_base_description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    CardPayment,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "ref", rename_all = "snake_case")]
pub enum Counterpart {
    /// Index into the same batch's transaction list.
    InBatch(usize),
    /// Id of an already persisted transaction.
    Stored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLink {
    pub transfer_key: String,
    pub kind: TransferKind,
    pub counterpart: Counterpart,
}

/// A fully processed row, ready to be handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub description: String,
    pub normalized_description: String,
    pub amount: Money,
    pub kind: TransactionKind,
    pub external_id: Option<String>,
    pub fingerprint: String,
    pub category_id: Option<CategoryId>,
    pub installment: Option<InstallmentInfo>,
    pub transfer: Option<TransferLink>,
    pub source_type: SourceType,
    pub line: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_parses_case_insensitively() {
        assert_eq!("CSV".parse::<SourceType>().unwrap(), SourceType::Csv);
        assert_eq!(" ofx ".parse::<SourceType>().unwrap(), SourceType::Ofx);
        assert_eq!("qfx".parse::<SourceType>().unwrap(), SourceType::Ofx);
        assert!("xlsx".parse::<SourceType>().is_err());
    }

    #[test]
    fn kind_follows_amount_sign() {
        assert_eq!(TransactionKind::from_amount(Money::from_cents(-1)), TransactionKind::Expense);
        assert_eq!(TransactionKind::from_amount(Money::from_cents(250_000)), TransactionKind::Income);
    }

    #[test]
    fn classification_confidence_is_clamped() {
        let c = DocumentClassification::new(DocumentType::BankStatement, "itau", 3.0);
        assert_eq!(c.confidence, 1.0);
        assert!(!c.is_invoice());
        assert_eq!(DocumentClassification::unknown(DocumentType::CreditCardInvoice).issuer_profile, "unknown");
    }

    #[test]
    fn document_type_serializes_snake_case() {
        let json = serde_json::to_string(&DocumentType::CreditCardInvoice).unwrap();
        assert_eq!(json, "\"credit_card_invoice\"");
    }
}
