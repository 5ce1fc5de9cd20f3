use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Tunables for one import pipeline. Every field has a default, so an empty
/// TOML document is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
    pub csv: CsvConfig,
    pub ofx: OfxConfig,
    pub reconcile: ReconcileConfig,
}

impl ImportConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CsvConfig {
    /// How many leading rows are considered when looking for the header.
    pub header_scan_rows: usize,
    /// Mapping confidence below which a warning is logged.
    pub low_confidence_threshold: f32,
    /// Minimum similarity for a fuzzy header/synonym match.
    pub fuzzy_threshold: f32,
    /// Share of U+FFFD characters above which the file is re-read as Latin-1.
    pub mojibake_ratio: f32,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            header_scan_rows: 30,
            low_confidence_threshold: 0.5,
            fuzzy_threshold: 0.8,
            mojibake_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfxConfig {
    /// Share of U+FFFD characters above which the file is re-read as Latin-1.
    pub mojibake_ratio: f32,
}

impl Default for OfxConfig {
    fn default() -> Self {
        Self { mojibake_ratio: 0.01 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Maximum distance in days between the two legs of a transfer. 0 = same day.
    pub date_window_days: u32,
    /// Word sequences (normalized) that mark a card invoice payment.
    pub card_payment_keywords: Vec<String>,
    /// Word sequences (normalized) that mark an account-to-account transfer.
    pub transfer_keywords: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            date_window_days: 0,
            card_payment_keywords: to_strings(&[
                "PAGAMENTO FATURA",
                "PAGTO FATURA",
                "PAG FATURA",
                "PAGAMENTO DE FATURA",
                "PAGTO CARTAO",
                "PAGAMENTO CARTAO",
                "PAGAMENTO RECEBIDO",
                "CREDIT CARD PAYMENT",
                "CARD PAYMENT",
            ]),
            transfer_keywords: to_strings(&[
                "TRANSFERENCIA",
                "TRANSF",
                "TED",
                "DOC",
                "TRANSFER",
            ]),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
