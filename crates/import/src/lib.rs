//! Statement import: format parsers, normalization, fingerprinting,
//! categorization rules, transfer reconciliation and the orchestrator that
//! ties them into one batch.

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: ::std::sync::OnceLock<Regex> = ::std::sync::OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}
pub(crate) use re;

pub mod config;
pub mod csv;
pub mod draft;
pub mod fingerprint;
pub mod installment;
pub mod normalize;
pub mod ofx;
pub mod pdf;
pub mod pipeline;
pub mod reconcile;
pub mod rules;
pub(crate) mod util;

pub use config::{ConfigError, CsvConfig, ImportConfig, OfxConfig, ReconcileConfig};
pub use csv::{
    detect_header_row, suggest_csv_mapping, CsvColumnMapping, CsvDocument, CsvError,
    CsvImportProfile, CsvMappingSuggestion, CsvRole,
};
pub use draft::{ParsedDocument, RowIssue, RowIssueKind};
pub use fingerprint::{create_imported_hash, create_transfer_key_hash};
pub use installment::{extract_installment_info, has_installment_marker, strip_installment_marker};
pub use normalize::{normalize_description, parse_date, parse_money, DecimalSeparator, NormalizeError};
pub use ofx::{OfxError, OfxStatement};
pub use pdf::{classify_pdf_text, PdfError, StaticText, TextExtractor};
pub use pipeline::{
    CommitBatch, DocumentHint, ImportError, ImportOutcome, ImportPipeline, ImportRequest,
    ImportStage, ImportStore, RawImportDocument, RulesSource,
};
pub use reconcile::{CounterLegQuery, ReconcileOutcome, StoredLeg, StoredLink, TransferMatcher};
pub use rules::{
    matches_rule, resolve_rule_category, CategoryRuleEngine, RuleCandidate, RuleSet, RulesError,
};
