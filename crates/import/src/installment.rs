//! "N of M" installment markers in purchase descriptions.

use extrato_core::InstallmentInfo;
use regex::{Captures, Regex};

use crate::normalize::normalize_description;
use crate::re;

re!(re_word_form,
    r"(?i)\bparcelas?\s*(\d{1,2})\s*(?:de|/|-)\s*(\d{1,2})\b");
re!(re_alias_form,
    r"(?i)\b(?:parc|pcla|pcl|prc|pc)\.?\s*(\d{1,2})\s*[/\-]\s*(\d{1,2})\b");
re!(re_trailing_fraction,
    r"(?:^|\s)[\(\[]?(\d{1,2})/(\d{1,2})[\)\]]?\s*$");

const RESIDUAL_SEPARATORS: &[char] = &['-', '/', '|', '*', ':', ',', '(', ')', '[', ']'];

struct Marker {
    current: u32,
    total: u32,
    start: usize,
    end: usize,
}

fn marker_from(caps: &Captures<'_>, min_total: u32) -> Option<Marker> {
    let whole = caps.get(0)?;
    let current: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;
    if current == 0 || total < min_total || current > total {
        return None;
    }
    Some(Marker {
        current,
        total,
        start: whole.start(),
        end: whole.end(),
    })
}

fn find_marker(description: &str) -> Option<Marker> {
    // Keyword forms are tried before the bare fraction so "PARC 2/10 3/4"
    // picks the labelled marker.
    let keyword = [re_word_form(), re_alias_form()]
        .into_iter()
        .find_map(|re| re.captures_iter(description).find_map(|c| marker_from(&c, 1)));
    keyword.or_else(|| {
        let caps = re_trailing_fraction().captures(description)?;
        let marker = marker_from(&caps, 2)?;
        let bracketed = caps[0].trim_start().starts_with(['(', '[']);
        (bracketed || !looks_like_day_month(&marker)).then_some(marker)
    })
}

// A bare "05/12" at the end of a line is more often a date than a marker.
fn looks_like_day_month(marker: &Marker) -> bool {
    marker.total <= 12
}

fn cut(description: &str, marker: &Marker) -> String {
    let joined = format!(
        "{} {}",
        &description[..marker.start],
        &description[marker.end..]
    );
    joined
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c.is_whitespace() || RESIDUAL_SEPARATORS.contains(&c))
        .to_string()
}

/// Parse an installment marker such as `"Parcela 06 de 06"`, `"parc 2/10"`
/// or `"PCLA 03-12"`. Returns `None` when the description carries no marker.
pub fn extract_installment_info(description: &str) -> Option<InstallmentInfo> {
    let marker = find_marker(description)?;
    let base_description = cut(description, &marker);

    Some(InstallmentInfo {
        current_installment: marker.current,
        total_installments: marker.total,
        remaining_installments: marker.total.saturating_sub(marker.current),
        marker: format!("{}/{}", marker.current, marker.total),
        normalized_base_description: normalize_description(&base_description),
        base_description,
    })
}

pub fn has_installment_marker(description: &str) -> bool {
    find_marker(description).is_some()
}

/// The description without its installment marker, or the trimmed input
/// when there is none.
pub fn strip_installment_marker(description: &str) -> String {
    match find_marker(description) {
        Some(marker) => cut(description, &marker),
        None => description.trim().to_string(),
    }
}
