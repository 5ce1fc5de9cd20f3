//! Lenient OFX/QFX reader.
//!
//! OFX 1.x is SGML with unclosed leaf tags, OFX 2.x is XML, and bank exports
//! mix both. Rather than parse either grammar, the reader scrapes
//! `<TAG>value` pairs inside each `<STMTTRN>` block.

use extrato_core::{DocumentClassification, DocumentType, ParsedDraftTransaction};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::OfxConfig;
use crate::draft::{ParsedDocument, RowIssue, RowIssueKind};
use crate::normalize::{
    decode_text, normalize_description, parse_date, parse_money_with, DecimalSeparator,
    TextEncoding,
};
use crate::re;

re!(re_tag, r"(?i)<([A-Z0-9.]+)>([^<\r\n]*)");
re!(re_stmttrn_open, r"(?i)<STMTTRN>");
re!(re_stmttrn_close, r"(?i)</STMTTRN>|</BANKTRANLIST>");
re!(re_ofx_marker, r"(?i)<OFX>|OFXHEADER|<STMTTRN>");

#[derive(Error, Debug)]
pub enum OfxError {
    #[error("Not an OFX document")]
    NotOfx,
}

#[derive(Debug, Clone)]
pub struct OfxStatement {
    pub classification: DocumentClassification,
    pub account_id: Option<String>,
    pub currency: Option<String>,
    pub encoding: TextEncoding,
    pub drafts: Vec<ParsedDraftTransaction>,
    pub issues: Vec<RowIssue>,
}

impl OfxStatement {
    pub fn into_parsed(self) -> ParsedDocument {
        ParsedDocument {
            classification: self.classification,
            drafts: self.drafts,
            issues: self.issues,
            account_number: self.account_id,
            mapping_confidence: None,
        }
    }
}

/// First-occurrence `<TAG>value` pairs of a fragment, tag names uppercased.
fn scan_tags(fragment: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for caps in re_tag().captures_iter(fragment) {
        let value = caps[2].trim();
        if value.is_empty() {
            continue;
        }
        tags.entry(caps[1].to_uppercase())
            .or_insert_with(|| value.to_string());
    }
    tags
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_uppercase().find(&needle.to_ascii_uppercase())
}

/// Where the account block starts and what kind of document it is.
fn classify(text: &str) -> (DocumentType, Option<usize>) {
    let card = ["<CREDITCARDMSGSRSV1>", "<CCSTMTRS>"]
        .iter()
        .find_map(|marker| find_ci(text, marker));
    if let Some(pos) = card {
        return (DocumentType::CreditCardInvoice, Some(pos));
    }
    let bank = ["<BANKMSGSRSV1>", "<STMTRS>"]
        .iter()
        .find_map(|marker| find_ci(text, marker));
    (DocumentType::BankStatement, bank)
}

fn issuer_profile(org: Option<&String>) -> String {
    match org {
        Some(org) => {
            let slug = normalize_description(org)
                .to_lowercase()
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("_");
            if slug.is_empty() {
                DocumentClassification::UNKNOWN_ISSUER.to_string()
            } else {
                slug
            }
        }
        None => DocumentClassification::UNKNOWN_ISSUER.to_string(),
    }
}

// OFX never groups thousands, so a lone separator is always the decimal point.
fn decimal_hint(raw: &str) -> DecimalSeparator {
    if raw.contains(',') && !raw.contains('.') {
        DecimalSeparator::Comma
    } else {
        DecimalSeparator::Dot
    }
}

/// 1-based line numbers of ascending byte offsets, scanning the text once.
struct LineCounter<'a> {
    text: &'a str,
    offset: usize,
    line: usize,
}

impl<'a> LineCounter<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, offset: 0, line: 1 }
    }

    fn line_at(&mut self, offset: usize) -> usize {
        self.line += self.text[self.offset..offset].matches('\n').count();
        self.offset = offset;
        self.line
    }
}

const DEBIT_TYPES: &[&str] = &["DEBIT", "POS", "ATM", "FEE", "SRVCHG", "CHECK"];
const CREDIT_TYPES: &[&str] = &["CREDIT", "DEP", "DIRECTDEP", "INT", "DIV"];

/// Card issuers that export charges unsigned still tag them with `TRNTYPE`.
/// Amounts whose sign contradicts the declared type are negated; untyped
/// amounts are already signed from the holder's view and stay as they are.
fn correct_card_sign(draft: &mut ParsedDraftTransaction) -> bool {
    let Some(kind) = draft.raw.get("TRNTYPE").map(|t| t.to_ascii_uppercase()) else {
        return false;
    };
    let contradicts = (DEBIT_TYPES.contains(&kind.as_str()) && draft.amount.is_positive())
        || (CREDIT_TYPES.contains(&kind.as_str()) && draft.amount.is_negative());
    if contradicts {
        draft.amount = -draft.amount;
    }
    contradicts
}

/// Byte ranges of every `<STMTTRN>` block. A block ends at its closing tag,
/// the end of the transaction list, or the next opening tag, whichever
/// comes first.
fn transaction_blocks(text: &str) -> Vec<(usize, usize)> {
    let starts: Vec<usize> = re_stmttrn_open().find_iter(text).map(|m| m.end()).collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let limit = starts.get(i + 1).copied().unwrap_or(text.len());
            let end = re_stmttrn_close()
                .find(&text[start..limit])
                .map_or(limit, |m| start + m.start());
            (start, end)
        })
        .collect()
}

fn parse_transaction(text: &str, line: usize, start: usize, end: usize) -> Result<ParsedDraftTransaction, RowIssue> {
    let tags = scan_tags(&text[start..end]);

    let raw_date = ["DTPOSTED", "DTUSER", "DTAVAIL"]
        .iter()
        .find_map(|tag| tags.get(*tag))
        .ok_or_else(|| RowIssue::new(line, RowIssueKind::InvalidDate, "missing DTPOSTED"))?;
    let date = parse_date(raw_date)
        .map_err(|e| RowIssue::new(line, RowIssueKind::InvalidDate, e.to_string()))?;

    let raw_amount = tags
        .get("TRNAMT")
        .ok_or_else(|| RowIssue::new(line, RowIssueKind::InvalidAmount, "missing TRNAMT"))?;
    let amount = parse_money_with(raw_amount, Some(decimal_hint(raw_amount)))
        .map_err(|e| RowIssue::new(line, RowIssueKind::InvalidAmount, e.to_string()))?;

    let description = tags
        .get("MEMO")
        .or_else(|| tags.get("NAME"))
        .cloned()
        .unwrap_or_default();

    Ok(ParsedDraftTransaction {
        line,
        date,
        normalized_description: normalize_description(&description),
        description,
        amount,
        external_id: tags.get("FITID").cloned(),
        account_label: None,
        raw: tags,
    })
}

pub fn parse(data: &[u8], config: &OfxConfig) -> Result<OfxStatement, OfxError> {
    let (text, encoding) = decode_text(data, config.mojibake_ratio);
    if !re_ofx_marker().is_match(&text) {
        return Err(OfxError::NotOfx);
    }

    let (document_type, block_start) = classify(&text);
    let account_tags = scan_tags(&text[block_start.unwrap_or(0)..]);
    let header_tags = scan_tags(&text);

    let mut drafts = Vec::new();
    let mut issues = Vec::new();
    let mut lines = LineCounter::new(&text);
    for (start, end) in transaction_blocks(&text) {
        let line = lines.line_at(start);
        match parse_transaction(&text, line, start, end) {
            Ok(draft) => drafts.push(draft),
            Err(issue) => issues.push(issue),
        }
    }

    let confidence = if block_start.is_some() { 1.0 } else { 0.5 };
    let classification = DocumentClassification::new(
        document_type,
        issuer_profile(header_tags.get("ORG")),
        confidence,
    );
    if classification.is_invoice() {
        let mut corrected = 0;
        for draft in drafts.iter_mut() {
            if correct_card_sign(draft) {
                corrected += 1;
            }
        }
        if corrected > 0 {
            tracing::debug!(corrected, "OFX card amounts negated to match TRNTYPE");
        }
    }

    tracing::debug!(
        document_type = ?classification.document_type,
        ?encoding,
        transactions = drafts.len(),
        issues = issues.len(),
        "parsed OFX"
    );

    Ok(OfxStatement {
        classification,
        account_id: account_tags.get("ACCTID").cloned(),
        currency: header_tags.get("CURDEF").cloned(),
        encoding,
        drafts,
        issues,
    })
}
