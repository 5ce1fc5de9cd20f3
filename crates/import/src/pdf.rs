//! PDF statements: text extraction backends, document classification and a
//! line parser for the `DD/MM[/YYYY] description amount` layout most
//! Brazilian banks print.

use chrono::{Datelike, NaiveDate};
use extrato_core::{DocumentClassification, DocumentType, ParsedDraftTransaction};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::draft::{apply_invoice_sign_convention, ParsedDocument, RowIssue, RowIssueKind};
use crate::normalize::{normalize_description, parse_money_with, DecimalSeparator};
use crate::re;
use crate::util::contains_words;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("Text extraction failed: {0}")]
    Extraction(String),
    #[error("PDF has no extractable text")]
    NoText,
    #[error("PDF text extraction not available; build with `pdf-extract` feature")]
    NotAvailable,
}

/// Abstraction over a PDF text extractor.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, data: &[u8]) -> Result<String, PdfError>;
}

// ── Static backend (always available, used for tests) ────────────────────────

/// Returns pre-set text regardless of input.
pub struct StaticText {
    pub text: String,
}

impl StaticText {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl TextExtractor for StaticText {
    fn extract_text(&self, _data: &[u8]) -> Result<String, PdfError> {
        Ok(self.text.clone())
    }
}

/// Placeholder used when no backend is compiled in.
pub struct NoExtractor;

impl TextExtractor for NoExtractor {
    fn extract_text(&self, _data: &[u8]) -> Result<String, PdfError> {
        Err(PdfError::NotAvailable)
    }
}

// ── pdf-extract backend (optional, gated behind `pdf-extract` feature) ───────

#[cfg(feature = "pdf-extract")]
pub mod pdf_extract_backend {
    use super::{PdfError, TextExtractor};

    pub struct PdfExtractText;

    impl TextExtractor for PdfExtractText {
        fn extract_text(&self, data: &[u8]) -> Result<String, PdfError> {
            pdf_extract::extract_text_from_mem(data).map_err(|e| PdfError::Extraction(e.to_string()))
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────────

// Checked in order; the first issuer with any phrase present wins.
const ISSUERS: &[(&str, &[&str])] = &[
    ("nubank", &["NU PAGAMENTOS", "NUBANK"]),
    ("itau", &["ITAU UNIBANCO", "BANCO ITAU", "ITAUCARD"]),
    ("bradesco", &["BRADESCO", "BRADESCARD"]),
    ("santander", &["SANTANDER"]),
    ("caixa", &["CAIXA ECONOMICA FEDERAL", "CAIXA ECONOMICA"]),
    ("banco_do_brasil", &["BANCO DO BRASIL", "OUROCARD"]),
    ("inter", &["BANCO INTER"]),
    ("mercado_pago", &["MERCADO PAGO"]),
];

const INVOICE_KEYWORDS: &[&str] = &[
    "FATURA",
    "VENCIMENTO",
    "PAGAMENTO MINIMO",
    "LIMITE DE CREDITO",
    "TOTAL DA FATURA",
    "CREDIT CARD STATEMENT",
];

const STATEMENT_KEYWORDS: &[&str] = &[
    "EXTRATO",
    "SALDO",
    "SALDO ANTERIOR",
    "AGENCIA",
    "CONTA CORRENTE",
    "BANK STATEMENT",
];

/// Uppercase ASCII words only, so keywords match on word boundaries.
fn keyword_text(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    normalize_description(&spaced)
}

/// Classify extracted PDF text. Never fails: unrecognized text yields the
/// `"unknown"` issuer, a bank statement and zero confidence.
pub fn classify_pdf_text(raw_text: &str) -> DocumentClassification {
    let text = keyword_text(raw_text);

    let issuer = ISSUERS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| contains_words(&text, p)))
        .map(|(profile, _)| *profile);

    let hits = |keywords: &[&str]| keywords.iter().filter(|k| contains_words(&text, k)).count();
    let invoice = hits(INVOICE_KEYWORDS);
    let statement = hits(STATEMENT_KEYWORDS);

    let document_type = if invoice > statement {
        DocumentType::CreditCardInvoice
    } else {
        DocumentType::BankStatement
    };
    let margin = invoice.abs_diff(statement) as f32 / (invoice + statement).max(1) as f32;
    let issuer_weight = if issuer.is_some() { 0.5 } else { 0.0 };
    let confidence = issuer_weight + 0.5 * margin;

    DocumentClassification::new(
        document_type,
        issuer.unwrap_or(DocumentClassification::UNKNOWN_ISSUER),
        confidence,
    )
}

// ── Line parser ──────────────────────────────────────────────────────────────

re!(re_line,
    r"^\s*(\d{1,2})[/.](\d{1,2})(?:[/.](\d{4}|\d{2}))?\s+(.+?)\s+((?:[-+]\s*)?(?:R\$|US\$)?\s*[-+]?\d[\d.,]*[.,]\d{2}(?:\s?[-DC])?)\s*$");
re!(re_due_date,
    r"(?i)vencimento\D{0,30}?(\d{1,2})/(\d{1,2})/(\d{4})");
re!(re_full_date,
    r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b");
re!(re_account,
    r"(?i)\b(?:conta(?:\s+corrente)?|account)\b[^\d\n]{0,20}(\d[\d.\-/]{3,}\d)");

// Lines that carry an amount but are running totals, not transactions.
const SUMMARY_DESCRIPTIONS: &[&str] = &[
    "SALDO",
    "SALDO ANTERIOR",
    "SALDO DO DIA",
    "TOTAL",
    "TOTAL DA FATURA",
    "PAGAMENTO MINIMO",
];

fn reference_date(text: &str, document_type: DocumentType) -> Option<NaiveDate> {
    let to_date = |caps: regex::Captures<'_>| {
        NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?)
    };
    let due = if document_type == DocumentType::CreditCardInvoice {
        re_due_date().captures(text).and_then(to_date)
    } else {
        None
    };
    due.or_else(|| re_full_date().captures_iter(text).find_map(to_date))
}

fn is_summary_line(description: &str) -> bool {
    let normalized = keyword_text(description);
    SUMMARY_DESCRIPTIONS
        .iter()
        .any(|s| normalized == *s || normalized.starts_with(&format!("{s} ")))
}

// The printed amount always has two decimals, so the separator three
// characters from the last digit is the decimal point.
fn amount_hint(raw: &str) -> Option<DecimalSeparator> {
    let digits_end = raw.rfind(|c: char| c.is_ascii_digit())?;
    match raw.as_bytes().get(digits_end.checked_sub(2)?)? {
        b',' => Some(DecimalSeparator::Comma),
        b'.' => Some(DecimalSeparator::Dot),
        _ => None,
    }
}

fn resolve_year(day: u32, month: u32, year: Option<&str>, reference: Option<NaiveDate>) -> Option<NaiveDate> {
    let year = match year {
        Some(y) if y.len() == 2 => 2000 + y.parse::<i32>().ok()?,
        Some(y) => y.parse().ok()?,
        None => {
            let reference = reference?;
            if month > reference.month() {
                reference.year() - 1
            } else {
                reference.year()
            }
        }
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_line(
    line_no: usize,
    line: &str,
    reference: Option<NaiveDate>,
) -> Option<Result<ParsedDraftTransaction, RowIssue>> {
    let caps = re_line().captures(line)?;
    let description = caps[4].trim();
    if is_summary_line(description) {
        return None;
    }
    Some(build_draft(line_no, line, &caps, description, reference))
}

fn build_draft(
    line_no: usize,
    line: &str,
    caps: &regex::Captures<'_>,
    description: &str,
    reference: Option<NaiveDate>,
) -> Result<ParsedDraftTransaction, RowIssue> {
    let line = line.trim();
    let day: u32 = caps[1].parse().unwrap_or(0);
    let month: u32 = caps[2].parse().unwrap_or(0);
    let date = resolve_year(day, month, caps.get(3).map(|m| m.as_str()), reference)
        .ok_or_else(|| {
            RowIssue::new(line_no, RowIssueKind::InvalidDate, format!("Invalid date in '{line}'"))
        })?;

    let raw_amount = caps[5].trim();
    let amount = parse_money_with(raw_amount, amount_hint(raw_amount))
        .map_err(|e| RowIssue::new(line_no, RowIssueKind::InvalidAmount, e.to_string()))?;

    let mut raw = BTreeMap::new();
    raw.insert("line".to_string(), line.to_string());

    Ok(ParsedDraftTransaction {
        line: line_no,
        date,
        description: description.to_string(),
        normalized_description: normalize_description(description),
        amount,
        external_id: None,
        account_label: None,
        raw,
    })
}

/// Turn extracted text into drafts. Lines that do not look like a
/// transaction are not rows and are not counted.
pub fn parse_pdf_text(text: &str, forced: Option<DocumentType>) -> ParsedDocument {
    let mut classification = classify_pdf_text(text);
    if let Some(document_type) = forced {
        classification.document_type = document_type;
    }
    let reference = reference_date(text, classification.document_type);

    let mut drafts = Vec::new();
    let mut issues = Vec::new();
    for (index, line) in text.lines().enumerate() {
        match parse_line(index + 1, line, reference) {
            Some(Ok(draft)) => drafts.push(draft),
            Some(Err(issue)) => issues.push(issue),
            None => {}
        }
    }
    apply_invoice_sign_convention(&mut drafts, &classification);

    let account_number = re_account()
        .captures(text)
        .map(|caps| caps[1].to_string());

    ParsedDocument {
        classification,
        drafts,
        issues,
        account_number,
        mapping_confidence: None,
    }
}

pub fn parse(
    data: &[u8],
    extractor: &dyn TextExtractor,
    forced: Option<DocumentType>,
) -> Result<ParsedDocument, PdfError> {
    let text = extractor.extract_text(data)?;
    if text.trim().is_empty() {
        return Err(PdfError::NoText);
    }
    let document = parse_pdf_text(&text, forced);
    tracing::debug!(
        issuer = %document.classification.issuer_profile,
        document_type = ?document.classification.document_type,
        confidence = document.classification.confidence,
        drafts = document.drafts.len(),
        issues = document.issues.len(),
        "parsed PDF text"
    );
    Ok(document)
}
