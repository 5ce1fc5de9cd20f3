//! Canonicalization of raw text fields shared by every format parser.

use chrono::{DateTime, NaiveDate, Utc};
use extrato_core::Money;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::re;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("Invalid date: '{0}'")]
    InvalidDate(String),
    #[error("Invalid amount: '{0}'")]
    InvalidAmount(String),
}

/// Which character a document uses as the decimal point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecimalSeparator {
    Comma,
    Dot,
}

impl DecimalSeparator {
    fn as_char(self) -> char {
        match self {
            DecimalSeparator::Comma => ',',
            DecimalSeparator::Dot => '.',
        }
    }
}

// Amounts with more integer digits than this are rejected as garbage.
const MAX_INTEGER_DIGITS: usize = 15;

const CURRENCY_TOKENS: &[&str] = &["R$", "US$", "BRL", "USD", "EUR", "$", "€", "£"];

re!(re_compact_date,
    r"^(\d{4})(\d{2})(\d{2})(?:\d{2}(?:\d{2}(?:\d{2}(?:\.\d+)?)?)?)?\s*(?:\[[^\]]*\])?$");
re!(re_day_first,
    r"^(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})$");
re!(re_year_first,
    r"^(\d{4})[/.\-](\d{1,2})[/.\-](\d{1,2})$");

// ── Dates ─────────────────────────────────────────────────────────────────────

/// Parse a statement date into its calendar day.
///
/// Day-first is assumed for `NN/NN/YYYY` forms. Datetimes carrying an offset
/// are converted to their UTC calendar day; compact OFX stamps keep the
/// calendar day they were written with.
pub fn parse_date(raw: &str) -> Result<NaiveDate, NormalizeError> {
    let s = raw.trim().trim_matches('"').trim();
    let invalid = || NormalizeError::InvalidDate(s.to_string());
    if s.is_empty() {
        return Err(invalid());
    }

    if let Some(caps) = re_compact_date().captures(s) {
        return ymd(&caps[1], &caps[2], &caps[3]).ok_or_else(invalid);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }

    // Drop a trailing time component: "15/01/2024 10:30", "2024-01-15T10:30:00".
    let date_part = s
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or(s);

    if let Some(caps) = re_year_first().captures(date_part) {
        return ymd(&caps[1], &caps[2], &caps[3]).ok_or_else(invalid);
    }

    if let Some(caps) = re_day_first().captures(date_part) {
        let year = if caps[3].len() == 2 {
            format!("20{}", &caps[3])
        } else {
            caps[3].to_string()
        };
        return ymd(&year, &caps[2], &caps[1]).ok_or_else(invalid);
    }

    Err(invalid())
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

// ── Money ─────────────────────────────────────────────────────────────────────

pub fn parse_money(raw: &str) -> Result<Money, NormalizeError> {
    parse_money_with(raw, None)
}

/// Parse a money string into major units.
///
/// A single separator followed by exactly three digits (`1.234`, `1,234`) is
/// ambiguous and rejected unless `hint` says which character is the decimal
/// point. Empty input is always an error.
pub fn parse_money_with(
    raw: &str,
    hint: Option<DecimalSeparator>,
) -> Result<Money, NormalizeError> {
    let original = raw.trim();
    let invalid = || NormalizeError::InvalidAmount(original.to_string());

    let mut s = original.trim_matches('"').trim().to_string();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].trim().to_string();
    }

    // Debit/credit suffixes: "150,00 D", "150,00 C".
    let upper = s.to_uppercase();
    if let Some(rest) = upper.strip_suffix(" D") {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = upper.strip_suffix(" C") {
        s = rest.to_string();
    }

    for token in CURRENCY_TOKENS {
        s = s.replace(token, "");
    }
    let mut s: String = s.chars().filter(|c| !c.is_whitespace()).collect();

    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_suffix('-') {
        negative = !negative;
        s = rest.to_string();
    }

    if s.is_empty()
        || !s.chars().any(|c| c.is_ascii_digit())
        || !s.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '.')
    {
        return Err(invalid());
    }

    let (integer, fraction) = split_decimal(&s, hint).ok_or_else(invalid)?;
    if integer.len() > MAX_INTEGER_DIGITS {
        return Err(invalid());
    }

    let canonical = if fraction.is_empty() {
        integer
    } else {
        format!("{integer}.{fraction}")
    };
    let value = Decimal::from_str(&canonical).map_err(|_| invalid())?;
    let money = Money::from_decimal(value);
    Ok(if negative { -money } else { money })
}

/// Split a digits-and-separators string into integer and fraction digits.
fn split_decimal(s: &str, hint: Option<DecimalSeparator>) -> Option<(String, String)> {
    let commas = s.matches(',').count();
    let dots = s.matches('.').count();

    let decimal = match (commas, dots) {
        (0, 0) => None,
        (_, 0) | (0, _) => {
            let sep = if commas > 0 { ',' } else { '.' };
            let count = commas.max(dots);
            match hint.map(DecimalSeparator::as_char) {
                Some(h) if h == sep => {
                    if count > 1 {
                        return None;
                    }
                    Some(sep)
                }
                Some(_) => None,
                None if count > 1 => None,
                None => {
                    let (int_part, frac_part) = s.split_once(sep)?;
                    let thousands_shaped = frac_part.len() == 3
                        && !int_part.is_empty()
                        && !int_part.trim_start_matches('0').is_empty();
                    if thousands_shaped {
                        return None;
                    }
                    Some(sep)
                }
            }
        }
        _ => {
            let last_comma = s.rfind(',')?;
            let last_dot = s.rfind('.')?;
            Some(if last_comma > last_dot { ',' } else { '.' })
        }
    };

    let (int_part, frac_part) = match decimal {
        Some(sep) => {
            let (i, f) = s.rsplit_once(sep)?;
            if f.contains([',', '.']) {
                return None;
            }
            (i, f)
        }
        None => (s, ""),
    };

    let thousands = match decimal {
        Some(',') => '.',
        Some(_) => ',',
        None => {
            if commas > 0 {
                ','
            } else {
                '.'
            }
        }
    };

    let mut groups = int_part.split(thousands);
    let first = groups.next().unwrap_or_default();
    let rest: Vec<&str> = groups.collect();
    if !rest.is_empty() {
        if first.is_empty() || first.len() > 3 || rest.iter().any(|g| g.len() != 3) {
            return None;
        }
    } else if int_part.contains(thousands) {
        return None;
    }

    let mut integer: String = std::iter::once(first).chain(rest).collect();
    if integer.is_empty() {
        integer.push('0');
    }
    if !integer.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((integer, frac_part.to_string()))
}

// ── Descriptions ──────────────────────────────────────────────────────────────

/// Uppercase, strip diacritics, collapse whitespace. Used for hashing and
/// matching only; the original description is what users see.
pub fn normalize_description(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .filter(|c| !is_combining_mark(*c))
        .map(fold_diacritic)
        .flat_map(char::to_uppercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_combining_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036F}').contains(&c)
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ý' | 'ÿ' => 'y',
        'Ý' => 'Y',
        other => other,
    }
}

// ── Byte decoding ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decode as UTF-8, falling back to Latin-1 when the share of replacement
/// characters exceeds `mojibake_ratio`.
pub fn decode_text(data: &[u8], mojibake_ratio: f32) -> (String, TextEncoding) {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let utf8 = String::from_utf8_lossy(data);

    let total = utf8.chars().count();
    let replaced = utf8.chars().filter(|c| *c == char::REPLACEMENT_CHARACTER).count();
    if total > 0 && replaced as f32 / total as f32 > mojibake_ratio {
        let latin1: String = data.iter().map(|&b| b as char).collect();
        return (latin1, TextEncoding::Latin1);
    }

    (utf8.into_owned(), TextEncoding::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cents(raw: &str) -> i64 {
        parse_money(raw).unwrap().to_cents()
    }

    // ── parse_date ────────────────────────────────────────────────────────────

    #[test]
    fn parse_date_regional_forms() {
        assert_eq!(parse_date("15/01/2024").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("15-01-2024").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("15.01.2024").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("5/1/24").unwrap(), date(2024, 1, 5));
        assert_eq!(parse_date("2024-01-15").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("2024/01/15").unwrap(), date(2024, 1, 15));
    }

    #[test]
    fn parse_date_compact_ofx_stamps() {
        assert_eq!(parse_date("20240115").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("20240115120000").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("20240115120000.000[-3:BRT]").unwrap(), date(2024, 1, 15));
    }

    #[test]
    fn parse_date_rfc3339_uses_utc_day() {
        assert_eq!(parse_date("2024-01-15T23:30:00-03:00").unwrap(), date(2024, 1, 16));
        assert_eq!(parse_date("2024-01-15T10:00:00Z").unwrap(), date(2024, 1, 15));
    }

    #[test]
    fn parse_date_ignores_trailing_time() {
        assert_eq!(parse_date("15/01/2024 10:31").unwrap(), date(2024, 1, 15));
        assert_eq!(parse_date("2024-01-15T10:31:00").unwrap(), date(2024, 1, 15));
    }

    #[test]
    fn parse_date_rejects_garbage_and_impossible_days() {
        assert!(matches!(parse_date(""), Err(NormalizeError::InvalidDate(_))));
        assert!(parse_date("not-a-date").is_err());
        assert!(parse_date("31/02/2024").is_err());
        assert!(parse_date("20241301").is_err());
    }

    // ── parse_money ───────────────────────────────────────────────────────────

    #[test]
    fn parse_money_plain_and_signed() {
        assert_eq!(cents("123.45"), 12345);
        assert_eq!(cents("-120.55"), -12055);
        assert_eq!(cents("+2500.00"), 250000);
        assert_eq!(cents("100"), 10000);
    }

    #[test]
    fn parse_money_brazilian_format() {
        assert_eq!(cents("1.234,56"), 123456);
        assert_eq!(cents("R$ -1.234,56"), -123456);
        assert_eq!(cents("-R$ 50,00"), -5000);
        assert_eq!(cents("12.345.678,90"), 1234567890);
    }

    #[test]
    fn parse_money_us_format() {
        assert_eq!(cents("$1,234.56"), 123456);
        assert_eq!(cents("1,234,567"), 123456700);
    }

    #[test]
    fn parse_money_negative_markers() {
        assert_eq!(cents("(75.25)"), -7525);
        assert_eq!(cents("50,00-"), -5000);
        assert_eq!(cents("150,00 D"), -15000);
        assert_eq!(cents("150,00 C"), 15000);
    }

    #[test]
    fn parse_money_ambiguous_single_separator_needs_hint() {
        assert!(parse_money("1.234").is_err());
        assert!(parse_money("1,234").is_err());
        assert_eq!(
            parse_money_with("1.234", Some(DecimalSeparator::Comma)).unwrap().to_cents(),
            123400
        );
        assert_eq!(
            parse_money_with("1,234", Some(DecimalSeparator::Comma)).unwrap().to_cents(),
            123
        );
        assert_eq!(cents("0.125"), 13);
    }

    #[test]
    fn parse_money_rejects_empty_and_malformed() {
        assert!(matches!(parse_money(""), Err(NormalizeError::InvalidAmount(_))));
        assert!(parse_money("   ").is_err());
        assert!(parse_money("abc").is_err());
        assert!(parse_money("R$").is_err());
        assert!(parse_money("1,23,4.00").is_err());
        assert!(parse_money("12a.00").is_err());
        assert!(parse_money("9999999999999999.00").is_err());
    }

    // ── normalize_description ─────────────────────────────────────────────────

    #[test]
    fn normalize_description_folds_case_accents_and_spaces() {
        assert_eq!(normalize_description("  Padaria   São João  "), "PADARIA SAO JOAO");
        assert_eq!(normalize_description("Transferência\tPIX"), "TRANSFERENCIA PIX");
        assert_eq!(normalize_description("Cafe\u{0301} Açaí"), "CAFE ACAI");
    }

    // ── decode_text ───────────────────────────────────────────────────────────

    #[test]
    fn decode_text_keeps_valid_utf8() {
        let (text, enc) = decode_text("Padaria São João".as_bytes(), 0.01);
        assert_eq!(text, "Padaria São João");
        assert_eq!(enc, TextEncoding::Utf8);
    }

    #[test]
    fn decode_text_falls_back_to_latin1() {
        let bytes = b"Transfer\xeancia S\xe3o Jo\xe3o";
        let (text, enc) = decode_text(bytes, 0.01);
        assert_eq!(enc, TextEncoding::Latin1);
        assert_eq!(text, "Transferência São João");
    }

    #[test]
    fn decode_text_strips_bom() {
        let (text, _) = decode_text(b"\xEF\xBB\xBFdata", 0.01);
        assert_eq!(text, "data");
    }
}
