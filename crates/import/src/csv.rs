//! CSV statements with unknown delimiter, unknown header position and unknown
//! column layout.

use chrono::NaiveDate;
use extrato_core::{DocumentClassification, DocumentType, Money, ParsedDraftTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::CsvConfig;
use crate::draft::{apply_invoice_sign_convention, ParsedDocument, RowIssue, RowIssueKind};
use crate::normalize::{
    self, decode_text, normalize_description, parse_money_with, DecimalSeparator, TextEncoding,
};
use crate::util::{contains_words, similarity};

// ── Roles and synonyms ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvRole {
    Date,
    Description,
    Amount,
    Debit,
    Credit,
    Type,
    Account,
    Balance,
    ExternalId,
}

// Synonyms are written in normalized header form (see `normalize_header`).
const SYNONYMS: &[(CsvRole, &[&str])] = &[
    (
        CsvRole::Date,
        &[
            "DATA", "DATE", "DT", "DATA LANCAMENTO", "DATA DE LANCAMENTO", "DATA MOVIMENTO",
            "DATA DA TRANSACAO", "DATA COMPRA", "RELEASE DATE", "TRANSACTION DATE",
            "POSTED DATE", "POSTING DATE",
        ],
    ),
    (
        CsvRole::Description,
        &[
            "DESCRICAO", "DESCRIPTION", "HISTORICO", "LANCAMENTO", "ESTABELECIMENTO", "TITLE",
            "TITULO", "MEMO", "DETALHES", "NARRATIVE", "PAYEE",
        ],
    ),
    (
        CsvRole::Amount,
        &["VALOR", "AMOUNT", "VALUE", "QUANTIA", "MONTANTE", "NET AMOUNT", "VALOR R$"],
    ),
    (CsvRole::Debit, &["DEBITO", "DEBIT", "SAIDA", "SAIDAS", "WITHDRAWAL"]),
    (CsvRole::Credit, &["CREDITO", "CREDIT", "ENTRADA", "ENTRADAS", "DEPOSIT"]),
    (
        CsvRole::Type,
        &["TIPO", "TYPE", "TRANSACTION TYPE", "TIPO DE TRANSACAO", "NATUREZA"],
    ),
    (CsvRole::Account, &["CONTA", "ACCOUNT", "CARTAO", "CARD"]),
    (
        CsvRole::Balance,
        &["SALDO", "BALANCE", "PARTIAL BALANCE", "SALDO PARCIAL", "RUNNING BALANCE"],
    ),
    (
        CsvRole::ExternalId,
        &[
            "ID", "IDENTIFICADOR", "REFERENCE ID", "FITID", "TRANSACTION ID", "DOCUMENTO",
            "NUMERO DOCUMENTO", "REFERENCIA",
        ],
    ),
];

// Values of a type column that mark an unsigned amount as a debit.
const DEBIT_MARKERS: &[&str] = &["D", "DR", "DEBITO", "DEBIT", "SAIDA"];

// Header signatures of known exports: (issuer profile, document type, required headers).
const ISSUER_SIGNATURES: &[(&str, DocumentType, &[&str])] = &[
    (
        "mercado_pago",
        DocumentType::BankStatement,
        &["RELEASE DATE", "TRANSACTION NET AMOUNT"],
    ),
    (
        "nubank",
        DocumentType::CreditCardInvoice,
        &["DATE", "TITLE", "AMOUNT"],
    ),
    (
        "nubank",
        DocumentType::BankStatement,
        &["DATA", "VALOR", "IDENTIFICADOR", "DESCRICAO"],
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrength {
    Fuzzy,
    Partial,
    Exact,
}

impl MatchStrength {
    fn weight(self) -> f32 {
        match self {
            MatchStrength::Exact => 1.0,
            MatchStrength::Partial => 0.75,
            MatchStrength::Fuzzy => 0.5,
        }
    }
}

/// Uppercase, accent-free, punctuation collapsed: `"Data_Lançamento"` → `"DATA LANCAMENTO"`.
pub fn normalize_header(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.' | '/' | '(' | ')' | ':') { ' ' } else { c })
        .collect();
    normalize_description(&spaced)
}

/// Best (strength, specificity) with which `header` matches any synonym of `role`.
fn role_match(header: &str, role: CsvRole, fuzzy_threshold: f32) -> Option<(MatchStrength, usize)> {
    let synonyms = SYNONYMS.iter().find(|(r, _)| *r == role)?.1;
    let mut best: Option<(MatchStrength, usize)> = None;

    for synonym in synonyms.iter() {
        let words = synonym.split_whitespace().count();
        let candidate = if header == *synonym {
            Some((MatchStrength::Exact, words))
        } else if contains_words(header, synonym) {
            Some((MatchStrength::Partial, words))
        } else if header.chars().count() >= 4
            && synonym.chars().count() >= 4
            && similarity(header, synonym) >= fuzzy_threshold
        {
            Some((MatchStrength::Fuzzy, words))
        } else {
            None
        };
        if candidate > best {
            best = candidate;
        }
    }

    best
}

// ── Mapping ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvColumnMapping {
    pub date_column: Option<usize>,
    pub description_column: Option<usize>,
    pub amount_column: Option<usize>,
    pub debit_column: Option<usize>,
    pub credit_column: Option<usize>,
    pub type_column: Option<usize>,
    pub account_column: Option<usize>,
    pub balance_column: Option<usize>,
    pub external_id_column: Option<usize>,
    /// chrono format tried before the built-in date forms, e.g. `"%m/%d/%Y"`.
    pub date_format: Option<String>,
}

impl CsvColumnMapping {
    pub fn column(&self, role: CsvRole) -> Option<usize> {
        match role {
            CsvRole::Date => self.date_column,
            CsvRole::Description => self.description_column,
            CsvRole::Amount => self.amount_column,
            CsvRole::Debit => self.debit_column,
            CsvRole::Credit => self.credit_column,
            CsvRole::Type => self.type_column,
            CsvRole::Account => self.account_column,
            CsvRole::Balance => self.balance_column,
            CsvRole::ExternalId => self.external_id_column,
        }
    }

    fn set(&mut self, role: CsvRole, column: usize) {
        let slot = match role {
            CsvRole::Date => &mut self.date_column,
            CsvRole::Description => &mut self.description_column,
            CsvRole::Amount => &mut self.amount_column,
            CsvRole::Debit => &mut self.debit_column,
            CsvRole::Credit => &mut self.credit_column,
            CsvRole::Type => &mut self.type_column,
            CsvRole::Account => &mut self.account_column,
            CsvRole::Balance => &mut self.balance_column,
            CsvRole::ExternalId => &mut self.external_id_column,
        };
        *slot = Some(column);
    }

    fn has_money_column(&self) -> bool {
        self.amount_column.is_some() || self.debit_column.is_some() || self.credit_column.is_some()
    }

    /// Date, a money column and something to describe the row are required.
    pub fn validate(&self) -> Result<(), CsvError> {
        if self.date_column.is_none() {
            return Err(CsvError::MissingColumn("date".to_string()));
        }
        if !self.has_money_column() {
            return Err(CsvError::MissingColumn("amount".to_string()));
        }
        if self.description_column.is_none() && self.type_column.is_none() {
            return Err(CsvError::MissingColumn("description".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSuggestion {
    pub role: CsvRole,
    pub column: usize,
    pub header: String,
    pub strength: MatchStrength,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvMappingSuggestion {
    pub mapping: CsvColumnMapping,
    pub columns: Vec<ColumnSuggestion>,
    /// 0.0–1.0; how strongly the required roles were recognized.
    pub confidence: f32,
}

/// Map header cells to semantic roles.
///
/// Every (header, role) pair is scored; pairs are assigned greedily from the
/// strongest down, so an exact synonym always beats a partial or fuzzy one and
/// each header and role is used at most once. Ties go to the more specific
/// synonym, then the leftmost column.
pub fn suggest_csv_mapping(headers: &[String], fuzzy_threshold: f32) -> CsvMappingSuggestion {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    let mut candidates: Vec<(MatchStrength, usize, usize, CsvRole)> = Vec::new();
    for (column, header) in normalized.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        for (role, _) in SYNONYMS {
            if let Some((strength, words)) = role_match(header, *role, fuzzy_threshold) {
                candidates.push((strength, words, column, *role));
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.cmp(&a.1))
            .then(a.2.cmp(&b.2))
            .then(a.3.cmp(&b.3))
    });

    let mut mapping = CsvColumnMapping::default();
    let mut columns: Vec<ColumnSuggestion> = Vec::new();
    for (strength, _, column, role) in candidates {
        let column_taken = columns.iter().any(|c| c.column == column);
        if column_taken || mapping.column(role).is_some() {
            continue;
        }
        mapping.set(role, column);
        columns.push(ColumnSuggestion {
            role,
            column,
            header: headers[column].clone(),
            strength,
        });
    }
    columns.sort_by_key(|c| c.column);

    let confidence = mapping_confidence(&columns);
    CsvMappingSuggestion {
        mapping,
        columns,
        confidence,
    }
}

fn mapping_confidence(columns: &[ColumnSuggestion]) -> f32 {
    let strength_of = |roles: &[CsvRole]| {
        columns
            .iter()
            .filter(|c| roles.contains(&c.role))
            .map(|c| c.strength.weight())
            .fold(0.0f32, f32::max)
    };
    let date = strength_of(&[CsvRole::Date]);
    let money = strength_of(&[CsvRole::Amount, CsvRole::Debit, CsvRole::Credit]);
    let description = strength_of(&[CsvRole::Description])
        .max(strength_of(&[CsvRole::Type]) * 0.5);
    (date + money + description) / 3.0
}

// ── Header detection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderDetection {
    /// Index into the record list.
    pub row_index: usize,
    pub score: u32,
    pub suggestion: CsvMappingSuggestion,
}

/// Score the first `scan_rows` records as header candidates and pick the best.
///
/// A row only qualifies when it names a date and a money column; summary
/// blocks above the real header ("SALDO INICIAL;CREDITOS;DEBITOS") fail that
/// test or score lower. Earlier rows win ties.
pub fn detect_header_row(
    records: &[Vec<String>],
    scan_rows: usize,
    fuzzy_threshold: f32,
) -> Option<HeaderDetection> {
    let mut best: Option<HeaderDetection> = None;

    for (row_index, record) in records.iter().take(scan_rows).enumerate() {
        let suggestion = suggest_csv_mapping(record, fuzzy_threshold);
        let mapping = &suggestion.mapping;
        if mapping.date_column.is_none() || !mapping.has_money_column() {
            continue;
        }

        let score = suggestion.columns.len() as u32 * 2
            + suggestion
                .columns
                .iter()
                .filter(|c| c.strength == MatchStrength::Exact)
                .count() as u32;

        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(HeaderDetection {
                row_index,
                score,
                suggestion,
            });
        }
    }

    best
}

// ── Row analysis ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRowSummary {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub error_rows: usize,
    pub ignored_rows: usize,
}

#[derive(Debug, Clone)]
pub struct CsvAnalysis {
    pub drafts: Vec<ParsedDraftTransaction>,
    pub issues: Vec<RowIssue>,
    pub summary: CsvRowSummary,
}

/// A data row with its 1-based line number in the source file.
#[derive(Debug, Clone)]
pub struct CsvRecord {
    pub line: usize,
    pub fields: Vec<String>,
}

/// Apply `mapping` to every data row.
pub fn analyze_csv_rows(
    headers: &[String],
    rows: &[CsvRecord],
    mapping: &CsvColumnMapping,
    decimal: Option<DecimalSeparator>,
) -> CsvAnalysis {
    let mut drafts = Vec::new();
    let mut issues = Vec::new();

    for row in rows {
        match analyze_row(headers, row, mapping, decimal) {
            Ok(draft) => drafts.push(draft),
            Err(issue) => issues.push(issue),
        }
    }

    let ignored_rows = issues.iter().filter(|i| i.kind.is_ignorable()).count();
    let summary = CsvRowSummary {
        total_rows: rows.len(),
        valid_rows: drafts.len(),
        error_rows: issues.len() - ignored_rows,
        ignored_rows,
    };

    CsvAnalysis {
        drafts,
        issues,
        summary,
    }
}

fn field<'a>(row: &'a CsvRecord, column: Option<usize>) -> Option<&'a str> {
    column
        .and_then(|c| row.fields.get(c))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn analyze_row(
    headers: &[String],
    row: &CsvRecord,
    mapping: &CsvColumnMapping,
    decimal: Option<DecimalSeparator>,
) -> Result<ParsedDraftTransaction, RowIssue> {
    let line = row.line;
    if row.fields.iter().all(|f| f.trim().is_empty()) {
        return Err(RowIssue::new(line, RowIssueKind::EmptyLine, "empty line"));
    }

    let raw_date = field(row, mapping.date_column)
        .ok_or_else(|| RowIssue::new(line, RowIssueKind::InvalidDate, "missing date"))?;
    let date = parse_row_date(raw_date, mapping.date_format.as_deref())
        .map_err(|e| RowIssue::new(line, RowIssueKind::InvalidDate, e.to_string()))?;

    let amount_error = |e: normalize::NormalizeError| {
        RowIssue::new(line, RowIssueKind::InvalidAmount, e.to_string())
    };
    let mut amount = if let Some(raw) = field(row, mapping.amount_column) {
        parse_money_with(raw, decimal).map_err(amount_error)?
    } else if mapping.debit_column.is_some() || mapping.credit_column.is_some() {
        let debit = field(row, mapping.debit_column)
            .map(|s| parse_money_with(s, decimal))
            .transpose()
            .map_err(amount_error)?;
        let credit = field(row, mapping.credit_column)
            .map(|s| parse_money_with(s, decimal))
            .transpose()
            .map_err(amount_error)?;
        match (debit, credit) {
            (None, None) => {
                return Err(RowIssue::new(
                    line,
                    RowIssueKind::InvalidAmount,
                    "no debit or credit value",
                ))
            }
            (d, c) => {
                c.map(Money::abs).unwrap_or_else(Money::zero)
                    - d.map(Money::abs).unwrap_or_else(Money::zero)
            }
        }
    } else {
        return Err(RowIssue::new(line, RowIssueKind::InvalidAmount, "missing amount"));
    };

    let type_value = field(row, mapping.type_column);
    if let Some(kind) = type_value {
        let marker = normalize_header(kind);
        if amount.is_positive() && DEBIT_MARKERS.contains(&marker.as_str()) {
            amount = -amount;
        }
    }

    let description = field(row, mapping.description_column)
        .or(type_value)
        .unwrap_or_default()
        .to_string();

    let raw = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            let value = row.fields.get(i)?;
            let key = if h.trim().is_empty() {
                format!("col{i}")
            } else {
                h.trim().to_string()
            };
            Some((key, value.clone()))
        })
        .collect::<BTreeMap<_, _>>();

    Ok(ParsedDraftTransaction {
        line,
        date,
        normalized_description: normalize_description(&description),
        description,
        amount,
        external_id: field(row, mapping.external_id_column).map(str::to_string),
        account_label: field(row, mapping.account_column).map(str::to_string),
        raw,
    })
}

fn parse_row_date(raw: &str, format: Option<&str>) -> Result<NaiveDate, normalize::NormalizeError> {
    if let Some(fmt) = format {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Ok(date);
        }
    }
    normalize::parse_date(raw)
}

// ── Document parsing ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Missing required column: {0}")]
    MissingColumn(String),
    #[error("No header row with a date and an amount column was found")]
    HeaderNotFound,
    #[error("Document has no rows")]
    Empty,
}

/// Caller overrides; everything left `None` is detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvImportProfile {
    pub name: String,
    pub mapping: Option<CsvColumnMapping>,
    pub has_header: bool,
    pub delimiter: Option<u8>,
    pub decimal_separator: Option<DecimalSeparator>,
    pub document_type: Option<DocumentType>,
}

impl Default for CsvImportProfile {
    fn default() -> Self {
        Self {
            name: "Auto-detected".to_string(),
            mapping: None,
            has_header: true,
            delimiter: None,
            decimal_separator: None,
            document_type: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvDocument {
    pub encoding: TextEncoding,
    pub delimiter: u8,
    /// Index of the header among the parsed records, if the file has one.
    pub header_row: Option<usize>,
    pub headers: Vec<String>,
    pub suggestion: CsvMappingSuggestion,
    pub classification: DocumentClassification,
    pub analysis: CsvAnalysis,
}

impl CsvDocument {
    pub fn into_parsed(self) -> ParsedDocument {
        ParsedDocument {
            classification: self.classification,
            drafts: self.analysis.drafts,
            issues: self.analysis.issues,
            account_number: None,
            mapping_confidence: Some(self.suggestion.confidence),
        }
    }
}

/// Pick `;`, `,` or tab by counting unquoted occurrences in the first lines.
pub fn sniff_delimiter(text: &str) -> u8 {
    let mut counts = [(b';', 0usize), (b',', 0usize), (b'\t', 0usize)];
    for line in text.lines().filter(|l| !l.trim().is_empty()).take(20) {
        let mut quoted = false;
        for c in line.bytes() {
            if c == b'"' {
                quoted = !quoted;
            } else if !quoted {
                if let Some(entry) = counts.iter_mut().find(|(d, _)| *d == c) {
                    entry.1 += 1;
                }
            }
        }
    }
    // Ties keep the earlier candidate.
    let mut best = (b',', 0usize);
    for (delimiter, count) in counts {
        if count > best.1 {
            best = (delimiter, count);
        }
    }
    best.0
}

fn decimal_for_delimiter(delimiter: u8) -> Option<DecimalSeparator> {
    match delimiter {
        b';' => Some(DecimalSeparator::Comma),
        b',' => Some(DecimalSeparator::Dot),
        _ => None,
    }
}

fn classify_headers(headers: &[String], forced: Option<DocumentType>) -> DocumentClassification {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let signature = ISSUER_SIGNATURES.iter().find(|(_, _, required)| {
        required.iter().all(|r| normalized.iter().any(|h| h == r))
    });

    match (signature, forced) {
        (Some((profile, document_type, _)), forced) => {
            DocumentClassification::new(forced.unwrap_or(*document_type), *profile, 0.9)
        }
        (None, Some(document_type)) => DocumentClassification::new(
            document_type,
            DocumentClassification::UNKNOWN_ISSUER,
            1.0,
        ),
        (None, None) => DocumentClassification::unknown(DocumentType::BankStatement),
    }
}

pub fn parse(
    data: &[u8],
    profile: &CsvImportProfile,
    config: &CsvConfig,
) -> Result<CsvDocument, CsvError> {
    let (text, encoding) = decode_text(data, config.mojibake_ratio);
    let delimiter = profile.delimiter.unwrap_or_else(|| sniff_delimiter(&text));

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut records: Vec<CsvRecord> = Vec::new();
    for result in reader.records() {
        let record = result?;
        let line = record.position().map_or(records.len() + 1, |p| p.line() as usize);
        records.push(CsvRecord {
            line,
            fields: record.iter().map(str::to_string).collect(),
        });
    }
    if records.is_empty() {
        return Err(CsvError::Empty);
    }

    let (header_row, headers, suggestion) = if profile.has_header {
        let fields: Vec<Vec<String>> = records.iter().map(|r| r.fields.clone()).collect();
        match detect_header_row(&fields, config.header_scan_rows, config.fuzzy_threshold) {
            Some(found) => {
                let headers = fields[found.row_index].clone();
                (Some(found.row_index), headers, found.suggestion)
            }
            None if profile.mapping.is_some() => {
                let headers = fields[0].clone();
                let suggestion = suggest_csv_mapping(&headers, config.fuzzy_threshold);
                (Some(0), headers, suggestion)
            }
            None => return Err(CsvError::HeaderNotFound),
        }
    } else {
        let width = records.iter().map(|r| r.fields.len()).max().unwrap_or(0);
        let headers = (0..width).map(|i| format!("col{i}")).collect();
        let suggestion = CsvMappingSuggestion {
            mapping: CsvColumnMapping::default(),
            columns: Vec::new(),
            confidence: 1.0,
        };
        (None, headers, suggestion)
    };

    let mapping = profile
        .mapping
        .clone()
        .unwrap_or_else(|| suggestion.mapping.clone());
    mapping.validate()?;

    if profile.mapping.is_none() && suggestion.confidence < config.low_confidence_threshold {
        tracing::warn!(
            confidence = suggestion.confidence,
            "low-confidence CSV column mapping"
        );
    }

    let data_rows = match header_row {
        Some(index) => &records[index + 1..],
        None => &records[..],
    };
    let decimal = profile
        .decimal_separator
        .or_else(|| decimal_for_delimiter(delimiter));

    let mut analysis = analyze_csv_rows(&headers, data_rows, &mapping, decimal);
    let classification = classify_headers(&headers, profile.document_type);
    apply_invoice_sign_convention(&mut analysis.drafts, &classification);

    tracing::debug!(
        delimiter = %(delimiter as char).escape_default(),
        header_row = ?header_row,
        total = analysis.summary.total_rows,
        valid = analysis.summary.valid_rows,
        errors = analysis.summary.error_rows,
        "parsed CSV"
    );

    Ok(CsvDocument {
        encoding,
        delimiter,
        header_row,
        headers,
        suggestion: CsvMappingSuggestion { mapping, ..suggestion },
        classification,
        analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn config() -> CsvConfig {
        CsvConfig::default()
    }

    // ── suggest_csv_mapping ───────────────────────────────────────────────────

    #[test]
    fn suggest_maps_portuguese_headers() {
        let s = suggest_csv_mapping(&headers(&["Data", "Histórico", "Valor (R$)", "Saldo"]), 0.8);
        assert_eq!(s.mapping.date_column, Some(0));
        assert_eq!(s.mapping.description_column, Some(1));
        assert_eq!(s.mapping.amount_column, Some(2));
        assert_eq!(s.mapping.balance_column, Some(3));
        assert!(s.confidence > 0.9);
    }

    #[test]
    fn suggest_prefers_exact_over_partial() {
        // "VALOR TOTAL" contains VALOR, but the exact "Valor" column wins.
        let s = suggest_csv_mapping(&headers(&["Data", "Descricao", "Valor Total", "Valor"]), 0.8);
        assert_eq!(s.mapping.amount_column, Some(3));
    }

    #[test]
    fn suggest_keeps_balance_out_of_amount() {
        let s = suggest_csv_mapping(
            &headers(&["RELEASE_DATE", "TRANSACTION_TYPE", "REFERENCE_ID", "TRANSACTION_NET_AMOUNT", "PARTIAL_BALANCE"]),
            0.8,
        );
        assert_eq!(s.mapping.date_column, Some(0));
        assert_eq!(s.mapping.type_column, Some(1));
        assert_eq!(s.mapping.external_id_column, Some(2));
        assert_eq!(s.mapping.amount_column, Some(3));
        assert_eq!(s.mapping.balance_column, Some(4));
        assert_eq!(s.mapping.description_column, None);
    }

    #[test]
    fn suggest_uses_fuzzy_matches_for_typos() {
        let s = suggest_csv_mapping(&headers(&["Data", "Descriçao", "Valorr"]), 0.8);
        assert_eq!(s.mapping.date_column, Some(0));
        assert_eq!(s.mapping.description_column, Some(1));
        assert_eq!(s.mapping.amount_column, Some(2));
        let amount = s.columns.iter().find(|c| c.role == CsvRole::Amount).unwrap();
        assert_eq!(amount.strength, MatchStrength::Fuzzy);
        assert!(s.confidence < 1.0);
    }

    #[test]
    fn suggest_debit_credit_layout() {
        let s = suggest_csv_mapping(&headers(&["date", "description", "debit", "credit"]), 0.8);
        assert_eq!(s.mapping.debit_column, Some(2));
        assert_eq!(s.mapping.credit_column, Some(3));
        assert_eq!(s.mapping.amount_column, None);
    }

    // ── detect_header_row ─────────────────────────────────────────────────────

    #[test]
    fn detect_skips_summary_block() {
        let rows = vec![
            headers(&["INITIAL_BALANCE", "CREDITS", "DEBITS", "FINAL_BALANCE"]),
            headers(&["1.000,00", "500,00", "-300,00", "1.200,00"]),
            headers(&["RELEASE_DATE", "TRANSACTION_TYPE", "REFERENCE_ID", "TRANSACTION_NET_AMOUNT", "PARTIAL_BALANCE"]),
            headers(&["01-03-2024", "Pix", "1", "-50,00", "950,00"]),
        ];
        let found = detect_header_row(&rows, 30, 0.8).unwrap();
        assert_eq!(found.row_index, 2);
    }

    #[test]
    fn detect_returns_none_without_date_and_amount() {
        let rows = vec![headers(&["foo", "bar"]), headers(&["1", "2"])];
        assert!(detect_header_row(&rows, 30, 0.8).is_none());
    }

    // ── analyze_csv_rows ──────────────────────────────────────────────────────

    fn record(line: usize, cells: &[&str]) -> CsvRecord {
        CsvRecord {
            line,
            fields: headers(cells),
        }
    }

    #[test]
    fn analyze_reports_per_row_errors() {
        let hs = headers(&["Data", "Descricao", "Valor"]);
        let mapping = suggest_csv_mapping(&hs, 0.8).mapping;
        let rows = vec![
            record(2, &["15/01/2024", "Padaria", "-12,50"]),
            record(3, &["", "", ""]),
            record(4, &["32/01/2024", "Bad date", "-1,00"]),
            record(5, &["16/01/2024", "Bad amount", "abc"]),
        ];
        let analysis = analyze_csv_rows(&hs, &rows, &mapping, Some(DecimalSeparator::Comma));
        assert_eq!(analysis.summary.total_rows, 4);
        assert_eq!(analysis.summary.valid_rows, 1);
        assert_eq!(analysis.summary.ignored_rows, 1);
        assert_eq!(analysis.summary.error_rows, 2);
        assert_eq!(analysis.issues[1].kind, RowIssueKind::InvalidDate);
        assert_eq!(analysis.issues[1].line, 4);
        assert_eq!(analysis.issues[2].kind, RowIssueKind::InvalidAmount);

        let draft = &analysis.drafts[0];
        assert_eq!(draft.amount.to_cents(), -1250);
        assert_eq!(draft.normalized_description, "PADARIA");
        assert_eq!(draft.raw.get("Valor").map(String::as_str), Some("-12,50"));
    }

    #[test]
    fn analyze_debit_credit_columns() {
        let hs = headers(&["date", "description", "debit", "credit"]);
        let mapping = suggest_csv_mapping(&hs, 0.8).mapping;
        let rows = vec![
            record(2, &["2024-01-15", "PAYMENT", "", "100.00"]),
            record(3, &["2024-01-16", "CHARGE", "50.00", ""]),
            record(4, &["2024-01-17", "NOTHING", "", ""]),
        ];
        let analysis = analyze_csv_rows(&hs, &rows, &mapping, Some(DecimalSeparator::Dot));
        assert_eq!(analysis.drafts[0].amount.to_cents(), 10000);
        assert_eq!(analysis.drafts[1].amount.to_cents(), -5000);
        assert_eq!(analysis.issues[0].kind, RowIssueKind::InvalidAmount);
    }

    #[test]
    fn analyze_trims_external_id_and_applies_type_markers() {
        let hs = headers(&["Data", "Descricao", "Valor", "Tipo", "Identificador"]);
        let mapping = suggest_csv_mapping(&hs, 0.8).mapping;
        let rows = vec![record(2, &["15/01/2024", "Mercado", "80,00", "D", "  abc-1  "])];
        let analysis = analyze_csv_rows(&hs, &rows, &mapping, Some(DecimalSeparator::Comma));
        let draft = &analysis.drafts[0];
        assert_eq!(draft.amount.to_cents(), -8000);
        assert_eq!(draft.external_id.as_deref(), Some("abc-1"));
    }

    // ── parse ─────────────────────────────────────────────────────────────────

    const MERCADO_PAGO: &str = "\
INITIAL_BALANCE;CREDITS;DEBITS;FINAL_BALANCE
1.000,00;2.500,00;-1.150,00;2.350,00

RELEASE_DATE;TRANSACTION_TYPE;REFERENCE_ID;TRANSACTION_NET_AMOUNT;PARTIAL_BALANCE
01-03-2024;Rendimentos;70001;2.500,00;3.500,00
02-03-2024;Pagamento com QR Pix Padaria;70002;-150,00;3.350,00
05-03-2024;Transferência Pix enviada;70003;-1.000,00;2.350,00
";

    #[test]
    fn parse_statement_with_leading_summary_block() {
        let doc = parse(MERCADO_PAGO.as_bytes(), &CsvImportProfile::default(), &config()).unwrap();
        assert_eq!(doc.delimiter, b';');
        assert_eq!(doc.headers[0], "RELEASE_DATE");
        assert_eq!(doc.suggestion.mapping.date_column, Some(0));
        assert_eq!(doc.headers[doc.suggestion.mapping.amount_column.unwrap()], "TRANSACTION_NET_AMOUNT");
        assert!(doc.analysis.summary.valid_rows >= 2);
        assert_eq!(doc.analysis.summary.error_rows, 0);
        assert_eq!(doc.classification.issuer_profile, "mercado_pago");

        let first = &doc.analysis.drafts[0];
        assert_eq!(first.amount.to_cents(), 250000);
        assert_eq!(first.description, "Rendimentos");
        assert_eq!(first.external_id.as_deref(), Some("70001"));
        assert_eq!(doc.analysis.drafts[2].normalized_description, "TRANSFERENCIA PIX ENVIADA");
    }

    #[test]
    fn parse_comma_file_with_quoted_amounts() {
        let data = b"date,description,amount\n2024-01-15,AMAZON,\"-1,049.99\"\n2024-01-16,REFUND,5.00\n";
        let doc = parse(data, &CsvImportProfile::default(), &config()).unwrap();
        assert_eq!(doc.delimiter, b',');
        assert_eq!(doc.analysis.drafts[0].amount.to_cents(), -104999);
        assert_eq!(doc.analysis.drafts[0].line, 2);
    }

    #[test]
    fn parse_nubank_card_export_flips_signs() {
        let data = b"date,title,amount\n2024-03-01,Padaria,12.50\n2024-03-02,Pagamento recebido,-500.00\n2024-03-03,Livraria,40.00\n";
        let doc = parse(data, &CsvImportProfile::default(), &config()).unwrap();
        assert!(doc.classification.is_invoice());
        assert_eq!(doc.classification.issuer_profile, "nubank");
        assert_eq!(doc.analysis.drafts[0].amount.to_cents(), -1250);
        assert_eq!(doc.analysis.drafts[1].amount.to_cents(), 50000);
    }

    #[test]
    fn parse_with_explicit_mapping_and_no_header() {
        let profile = CsvImportProfile {
            has_header: false,
            mapping: Some(CsvColumnMapping {
                date_column: Some(0),
                description_column: Some(1),
                amount_column: Some(2),
                date_format: Some("%m/%d/%Y".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let data = b"01/15/2024,COFFEE,-4.50\n";
        let doc = parse(data, &profile, &config()).unwrap();
        assert_eq!(doc.header_row, None);
        let draft = &doc.analysis.drafts[0];
        assert_eq!(draft.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(draft.amount.to_cents(), -450);
    }

    #[test]
    fn parse_errors_are_fatal_only_for_unreadable_layouts() {
        assert!(matches!(
            parse(b"", &CsvImportProfile::default(), &config()),
            Err(CsvError::Empty)
        ));
        assert!(matches!(
            parse(b"foo,bar\n1,2\n", &CsvImportProfile::default(), &config()),
            Err(CsvError::HeaderNotFound)
        ));
    }

    #[test]
    fn sniff_prefers_semicolons_over_decimal_commas() {
        assert_eq!(sniff_delimiter("Data;Valor\n01/01/2024;-1,50\n"), b';');
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3\n"), b',');
        assert_eq!(sniff_delimiter("no delimiters here"), b',');
    }

    #[test]
    fn mojibake_ratio_comes_from_config() {
        let data = b"Data;Descricao;Valor\n01/03/2024;Padaria S\xe3o Jo\xe3o;-8,50\n";

        let doc = parse(data, &CsvImportProfile::default(), &CsvConfig::default()).unwrap();
        assert_eq!(doc.encoding, TextEncoding::Latin1);
        assert_eq!(doc.analysis.drafts[0].description, "Padaria São João");

        let tolerant = CsvConfig {
            mojibake_ratio: 0.5,
            ..CsvConfig::default()
        };
        let doc = parse(data, &CsvImportProfile::default(), &tolerant).unwrap();
        assert_eq!(doc.encoding, TextEncoding::Utf8);
        assert!(doc.analysis.drafts[0].description.contains(char::REPLACEMENT_CHARACTER));
    }
}
