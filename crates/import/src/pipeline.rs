//! The import orchestrator.
//!
//! One batch runs `Parsing → Normalizing → Deduplicating → Categorizing →
//! Reconciling → Committing → Done`. Row-level problems are counted and the
//! batch continues; parse, rule-loading and storage failures abort it before
//! anything is written.

use async_trait::async_trait;
use extrato_core::{
    AccountId, CategorizationRule, DocumentClassification, DocumentType, ImportCommitReport,
    NormalizedTransaction, ParsedDraftTransaction, RowOutcome, RowStatus, SourceType,
    TransactionKind, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use thiserror::Error;
use tracing::Instrument;

use crate::config::ImportConfig;
use crate::csv::{self, CsvError, CsvImportProfile};
use crate::draft::ParsedDocument;
use crate::fingerprint::create_imported_hash;
use crate::installment::extract_installment_info;
use crate::ofx::{self, OfxError};
use crate::pdf::{self, PdfError, TextExtractor};
use crate::reconcile::{CounterLegQuery, StoredLeg, StoredLink, TransferMatcher};
use crate::rules::{CategoryRuleEngine, RuleCandidate, RuleSet};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    Parsing,
    Normalizing,
    Deduplicating,
    Categorizing,
    Reconciling,
    Committing,
    Done,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportStage::Parsing => "parsing",
            ImportStage::Normalizing => "normalizing",
            ImportStage::Deduplicating => "deduplicating",
            ImportStage::Categorizing => "categorizing",
            ImportStage::Reconciling => "reconciling",
            ImportStage::Committing => "committing",
            ImportStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Unsupported source type: '{0}'")]
    UnsupportedSourceType(String),
    #[error("Unreadable document: {0}")]
    UnreadableDocument(String),
    #[error("CSV error: {0}")]
    Csv(#[from] CsvError),
    #[error("OFX error: {0}")]
    Ofx(#[from] OfxError),
    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),
    #[error("Storage error while {stage}: {source}")]
    Store {
        stage: ImportStage,
        #[source]
        source: BoxError,
    },
    #[error("Failed to load categorization rules: {0}")]
    Rules(#[source] BoxError),
}

impl ImportError {
    /// Stage the batch was in when it failed.
    pub fn stage(&self) -> ImportStage {
        match self {
            ImportError::UnsupportedSourceType(_)
            | ImportError::UnreadableDocument(_)
            | ImportError::Csv(_)
            | ImportError::Ofx(_)
            | ImportError::Pdf(_) => ImportStage::Parsing,
            ImportError::Store { stage, .. } => *stage,
            ImportError::Rules(_) => ImportStage::Categorizing,
        }
    }

    fn store(stage: ImportStage, error: impl std::error::Error + Send + Sync + 'static) -> Self {
        ImportError::Store {
            stage,
            source: Box::new(error),
        }
    }
}

// ── Collaborators ────────────────────────────────────────────────────────────

/// Rows and pair updates persisted together by one commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitBatch<'a> {
    pub transactions: &'a [NormalizedTransaction],
    pub stored_links: &'a [StoredLink],
}

/// Persistence used by the orchestrator. `commit_batch` must be atomic.
///
/// The orchestrator does not serialize imports. Two batches for the same user
/// running at once can both see a fingerprint as new in `find_fingerprints`
/// and both reach `commit_batch`. Keeping the second copy out is the store's
/// job: `extrato_storage::SqliteStore` holds a `UNIQUE(user_id, fingerprint)`
/// constraint, so the later commit fails as a whole and nothing of it is
/// written.
#[async_trait]
pub trait ImportStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The subset of `fingerprints` already stored for `user_id`. The answer
    /// can be stale by the time `commit_batch` runs.
    async fn find_fingerprints(
        &self,
        user_id: &UserId,
        fingerprints: &[String],
    ) -> Result<HashSet<String>, Self::Error>;

    /// Stored transactions without a transfer key that satisfy any query.
    async fn find_counter_legs(
        &self,
        user_id: &UserId,
        queries: &[CounterLegQuery],
    ) -> Result<Vec<StoredLeg>, Self::Error>;

    async fn commit_batch(&self, user_id: &UserId, batch: CommitBatch<'_>) -> Result<(), Self::Error>;
}

#[async_trait]
pub trait RulesSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn list_enabled_rules(&self, user_id: &UserId) -> Result<Vec<CategorizationRule>, Self::Error>;
}

/// Rules loaded from TOML act as a source for every user they name.
#[async_trait]
impl RulesSource for RuleSet {
    type Error = Infallible;

    async fn list_enabled_rules(&self, user_id: &UserId) -> Result<Vec<CategorizationRule>, Infallible> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.enabled && &rule.user_id == user_id)
            .cloned()
            .collect())
    }
}

// ── Requests and outcomes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentHint {
    pub account_id: Option<AccountId>,
    pub file_name: Option<String>,
    /// Forces invoice or statement semantics for formats without markers.
    pub document_type: Option<DocumentType>,
}

#[derive(Debug, Clone)]
pub struct RawImportDocument {
    pub bytes: Vec<u8>,
    /// Declared format, e.g. `"csv"`; validated at the start of the run.
    pub source_type: String,
    pub hint: DocumentHint,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub user_id: UserId,
    pub document: RawImportDocument,
    /// Maps account labels found in the document (CSV account column, OFX
    /// `ACCTID`, PDF account number) to account ids.
    pub account_aliases: HashMap<String, AccountId>,
    pub csv_profile: Option<CsvImportProfile>,
}

impl ImportRequest {
    pub fn new(user_id: UserId, source_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            user_id,
            document: RawImportDocument {
                bytes,
                source_type: source_type.to_string(),
                hint: DocumentHint::default(),
            },
            account_aliases: HashMap::new(),
            csv_profile: None,
        }
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.document.hint.account_id = Some(account_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub report: ImportCommitReport,
    /// One entry per counted row, ordered by line.
    pub rows: Vec<RowOutcome>,
    pub transactions: Vec<NormalizedTransaction>,
    pub classification: DocumentClassification,
    pub committed: bool,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct ImportPipeline<S, R> {
    store: S,
    rules: R,
    extractor: Box<dyn TextExtractor>,
    config: ImportConfig,
    matcher: TransferMatcher,
}

fn default_extractor() -> Box<dyn TextExtractor> {
    #[cfg(feature = "pdf-extract")]
    {
        Box::new(crate::pdf::pdf_extract_backend::PdfExtractText)
    }
    #[cfg(not(feature = "pdf-extract"))]
    {
        Box::new(crate::pdf::NoExtractor)
    }
}

struct Batch {
    report: ImportCommitReport,
    rows: Vec<RowOutcome>,
}

impl Batch {
    fn row(&mut self, line: usize, status: RowStatus, message: Option<String>) {
        self.rows.push(match message {
            Some(message) => RowOutcome::with_message(line, status, message),
            None => RowOutcome::new(line, status),
        });
    }
}

impl<S: ImportStore, R: RulesSource> ImportPipeline<S, R> {
    pub fn new(store: S, rules: R, config: ImportConfig) -> Self {
        let matcher = TransferMatcher::new(config.reconcile.clone());
        Self {
            store,
            rules,
            extractor: default_extractor(),
            config,
            matcher,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run every stage and persist the surviving rows.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportOutcome, ImportError> {
        self.execute(request, true).await
    }

    /// Run every stage except Committing. Nothing is written.
    pub async fn preview(&self, request: ImportRequest) -> Result<ImportOutcome, ImportError> {
        self.execute(request, false).await
    }

    async fn execute(&self, request: ImportRequest, commit: bool) -> Result<ImportOutcome, ImportError> {
        let span = tracing::info_span!(
            "import",
            user_id = %request.user_id,
            source_type = %request.document.source_type,
            commit
        );
        self.stages(request, commit).instrument(span).await
    }

    async fn stages(&self, request: ImportRequest, commit: bool) -> Result<ImportOutcome, ImportError> {
        let user_id = request.user_id.clone();

        tracing::debug!(stage = %ImportStage::Parsing, "stage");
        let (source_type, parsed) = self.parse(&request)?;

        let mut batch = Batch {
            report: ImportCommitReport {
                total_rows: parsed.total_rows(),
                ..Default::default()
            },
            rows: Vec::with_capacity(parsed.total_rows()),
        };
        for issue in &parsed.issues {
            let status = if issue.kind.is_ignorable() {
                batch.report.ignored_rows += 1;
                RowStatus::Ignored
            } else {
                batch.report.error_rows += 1;
                RowStatus::Error
            };
            batch.row(issue.line, status, Some(format!("{}: {}", issue.kind, issue.message)));
        }

        tracing::debug!(stage = %ImportStage::Normalizing, drafts = parsed.drafts.len(), "stage");
        let default_account = request
            .document
            .hint
            .account_id
            .clone()
            .or_else(|| {
                parsed
                    .account_number
                    .as_ref()
                    .and_then(|n| request.account_aliases.get(n).cloned())
            });
        let mut candidates = Vec::with_capacity(parsed.drafts.len());
        for draft in &parsed.drafts {
            match self.normalize(&user_id, source_type, draft, &request, default_account.as_ref()) {
                Ok(tx) => {
                    batch.report.valid_rows += 1;
                    candidates.push(tx);
                }
                Err(message) => {
                    batch.report.invalid_rows += 1;
                    batch.row(draft.line, RowStatus::Invalid, Some(message));
                }
            }
        }

        tracing::debug!(stage = %ImportStage::Deduplicating, "stage");
        let mut survivors = self.deduplicate(&user_id, candidates, &mut batch).await?;

        tracing::debug!(stage = %ImportStage::Categorizing, "stage");
        self.categorize(&user_id, &mut survivors).await?;

        tracing::debug!(stage = %ImportStage::Reconciling, "stage");
        let queries = self.matcher.counter_leg_queries(&survivors);
        let stored_legs = if queries.is_empty() {
            Vec::new()
        } else {
            self.store
                .find_counter_legs(&user_id, &queries)
                .await
                .map_err(|e| ImportError::store(ImportStage::Reconciling, e))?
        };
        let reconciled = self.matcher.reconcile(&user_id, &mut survivors, &stored_legs);
        batch.report.transfer_created = reconciled.transfer_created;
        batch.report.card_payment_detected = reconciled.card_payment_detected;
        batch.report.card_payment_not_converted = reconciled.card_payment_not_converted;

        if commit && !survivors.is_empty() {
            tracing::debug!(stage = %ImportStage::Committing, rows = survivors.len(), "stage");
            self.store
                .commit_batch(
                    &user_id,
                    CommitBatch {
                        transactions: &survivors,
                        stored_links: &reconciled.stored_links,
                    },
                )
                .await
                .map_err(|e| ImportError::store(ImportStage::Committing, e))?;
        }

        batch.report.imported = survivors.len();
        for tx in &survivors {
            batch.row(tx.line, RowStatus::Imported, None);
        }
        batch.rows.sort_by_key(|row| row.line);

        let report = batch.report;
        tracing::info!(
            stage = %ImportStage::Done,
            committed = commit,
            total = report.total_rows,
            valid = report.valid_rows,
            imported = report.imported,
            duplicates = report.duplicates,
            skipped = report.skipped,
            invalid = report.invalid_rows,
            errors = report.error_rows,
            ignored = report.ignored_rows,
            transfers = report.transfer_created,
            card_payments = report.card_payment_detected,
            card_payments_unconverted = report.card_payment_not_converted,
            "import finished"
        );

        Ok(ImportOutcome {
            report,
            rows: batch.rows,
            transactions: survivors,
            classification: parsed.classification,
            committed: commit,
        })
    }

    fn parse(&self, request: &ImportRequest) -> Result<(SourceType, ParsedDocument), ImportError> {
        let document = &request.document;
        let source_type: SourceType = document
            .source_type
            .parse()
            .map_err(|_| ImportError::UnsupportedSourceType(document.source_type.clone()))?;
        if document.bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ImportError::UnreadableDocument("document is empty".to_string()));
        }

        let parsed = match source_type {
            SourceType::Csv => {
                let mut profile = request.csv_profile.clone().unwrap_or_default();
                if document.hint.document_type.is_some() {
                    profile.document_type = document.hint.document_type;
                }
                csv::parse(&document.bytes, &profile, &self.config.csv)?.into_parsed()
            }
            SourceType::Ofx => ofx::parse(&document.bytes, &self.config.ofx)?.into_parsed(),
            SourceType::Pdf => {
                let parsed = pdf::parse(
                    &document.bytes,
                    self.extractor.as_ref(),
                    document.hint.document_type,
                )?;
                if parsed.classification.issuer_profile == DocumentClassification::UNKNOWN_ISSUER {
                    tracing::warn!(
                        confidence = parsed.classification.confidence,
                        "PDF issuer not recognized"
                    );
                }
                parsed
            }
        };
        Ok((source_type, parsed))
    }

    fn normalize(
        &self,
        user_id: &UserId,
        source_type: SourceType,
        draft: &ParsedDraftTransaction,
        request: &ImportRequest,
        default_account: Option<&AccountId>,
    ) -> Result<NormalizedTransaction, String> {
        let description = draft.description.trim();
        if description.is_empty() {
            return Err("empty description".to_string());
        }
        if draft.amount.is_zero() {
            return Err("zero amount".to_string());
        }
        let account_id = draft
            .account_label
            .as_ref()
            .and_then(|label| request.account_aliases.get(label))
            .or(default_account)
            .cloned()
            .ok_or_else(|| "no target account".to_string())?;

        let installment = extract_installment_info(description);
        let fingerprint = create_imported_hash(
            user_id,
            source_type,
            draft.date,
            draft.amount,
            &draft.normalized_description,
            &account_id,
            draft.external_id.as_deref(),
        );

        Ok(NormalizedTransaction {
            user_id: user_id.clone(),
            account_id,
            date: draft.date,
            description: description.to_string(),
            normalized_description: draft.normalized_description.clone(),
            amount: draft.amount,
            kind: TransactionKind::from_amount(draft.amount),
            external_id: draft
                .external_id
                .as_ref()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            fingerprint,
            category_id: None,
            installment,
            transfer: None,
            source_type,
            line: draft.line,
        })
    }

    async fn deduplicate(
        &self,
        user_id: &UserId,
        candidates: Vec<NormalizedTransaction>,
        batch: &mut Batch,
    ) -> Result<Vec<NormalizedTransaction>, ImportError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique = Vec::with_capacity(candidates.len());
        for tx in candidates {
            if seen.insert(tx.fingerprint.clone()) {
                unique.push(tx);
            } else {
                tracing::warn!(line = tx.line, "row repeats an earlier row of the same batch");
                batch.report.skipped += 1;
                batch.row(tx.line, RowStatus::Skipped, Some("repeated in batch".to_string()));
            }
        }
        if unique.is_empty() {
            return Ok(unique);
        }

        let fingerprints: Vec<String> = unique.iter().map(|tx| tx.fingerprint.clone()).collect();
        let existing = self
            .store
            .find_fingerprints(user_id, &fingerprints)
            .await
            .map_err(|e| ImportError::store(ImportStage::Deduplicating, e))?;

        let (duplicates, survivors): (Vec<_>, Vec<_>) = unique
            .into_iter()
            .partition(|tx| existing.contains(&tx.fingerprint));
        for tx in &duplicates {
            batch.report.duplicates += 1;
            batch.row(tx.line, RowStatus::Duplicate, Some("already imported".to_string()));
        }
        Ok(survivors)
    }

    async fn categorize(
        &self,
        user_id: &UserId,
        transactions: &mut [NormalizedTransaction],
    ) -> Result<(), ImportError> {
        if transactions.is_empty() {
            return Ok(());
        }
        let rules = self
            .rules
            .list_enabled_rules(user_id)
            .await
            .map_err(|e| ImportError::Rules(Box::new(e)))?;
        let engine = CategoryRuleEngine::new(rules);
        if engine.is_empty() {
            return Ok(());
        }

        for tx in transactions.iter_mut() {
            let candidate = RuleCandidate {
                description: &tx.description,
                normalized_description: &tx.normalized_description,
                amount: tx.amount,
                account_id: Some(&tx.account_id),
            };
            tx.category_id = engine.resolve(&candidate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::StaticText;
    use extrato_core::{CategoryId, Counterpart, RuleMatchType, TransferKind};
    use std::sync::Mutex;

    // ── In-memory collaborators ──────────────────────────────────────────────

    #[derive(Debug, Error)]
    #[error("store unavailable")]
    struct StoreDown;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<NormalizedTransaction>>,
        links: Mutex<Vec<StoredLink>>,
        fail_commit: bool,
    }

    impl MemoryStore {
        fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ImportStore for MemoryStore {
        type Error = StoreDown;

        async fn find_fingerprints(
            &self,
            user_id: &UserId,
            fingerprints: &[String],
        ) -> Result<HashSet<String>, StoreDown> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|tx| &tx.user_id == user_id && fingerprints.contains(&tx.fingerprint))
                .map(|tx| tx.fingerprint.clone())
                .collect())
        }

        async fn find_counter_legs(
            &self,
            user_id: &UserId,
            queries: &[CounterLegQuery],
        ) -> Result<Vec<StoredLeg>, StoreDown> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .enumerate()
                .filter(|(_, tx)| &tx.user_id == user_id && tx.transfer.is_none())
                .filter(|(_, tx)| {
                    queries.iter().any(|p| {
                        tx.account_id != p.exclude_account
                            && tx.amount == p.amount
                            && tx.date >= p.date_from
                            && tx.date <= p.date_to
                    })
                })
                .map(|(i, tx)| StoredLeg {
                    id: format!("row-{i}"),
                    account_id: tx.account_id.clone(),
                    date: tx.date,
                    amount: tx.amount,
                    normalized_description: tx.normalized_description.clone(),
                    external_id: tx.external_id.clone(),
                    transfer_key: None,
                })
                .collect())
        }

        async fn commit_batch(&self, _user_id: &UserId, batch: CommitBatch<'_>) -> Result<(), StoreDown> {
            if self.fail_commit {
                return Err(StoreDown);
            }
            self.rows.lock().unwrap().extend_from_slice(batch.transactions);
            self.links.lock().unwrap().extend_from_slice(batch.stored_links);
            Ok(())
        }
    }

    #[derive(Debug, Error)]
    #[error("rules unavailable")]
    struct RulesDown;

    struct FailingRules;

    #[async_trait]
    impl RulesSource for FailingRules {
        type Error = RulesDown;

        async fn list_enabled_rules(&self, _user_id: &UserId) -> Result<Vec<CategorizationRule>, RulesDown> {
            Err(RulesDown)
        }
    }

    fn user() -> UserId {
        UserId::from("user-1")
    }

    fn checking() -> AccountId {
        AccountId::from("checking")
    }

    fn no_rules() -> RuleSet {
        RuleSet::default()
    }

    fn pipeline<R: RulesSource>(store: MemoryStore, rules: R) -> ImportPipeline<MemoryStore, R> {
        ImportPipeline::new(store, rules, ImportConfig::default())
    }

    fn csv_request(body: &str) -> ImportRequest {
        ImportRequest::new(user(), "csv", body.as_bytes().to_vec()).with_account(checking())
    }

    const STATEMENT: &str = "\
Data;Descrição;Valor;Identificador
01/03/2024;Supermercado Bairro;-150,00;
02/03/2024;Salário;5.000,00;
03/03/2024;Notebook Gamer PCLA 03-12;-400,00;
;;;
04/03/2024;Data quebrada;abc;
05/03/2024;;-10,00;
";

    // ── Happy path ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn commits_valid_rows_and_counts_everything() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let outcome = p.run(csv_request(STATEMENT)).await.unwrap();
        let r = &outcome.report;

        assert!(outcome.committed);
        assert_eq!(r.total_rows, 6);
        assert_eq!(r.ignored_rows, 1);
        assert_eq!(r.error_rows, 1);
        assert_eq!(r.invalid_rows, 1);
        assert_eq!(r.valid_rows, 3);
        assert_eq!(r.imported, 3);
        assert!(r.is_balanced());
        assert_eq!(p.store().len(), 3);

        assert_eq!(outcome.rows.len(), 6);
        assert!(outcome.rows.windows(2).all(|w| w[0].line <= w[1].line));

        let notebook = &outcome.transactions[2];
        let installment = notebook.installment.as_ref().unwrap();
        assert_eq!(installment.marker, "3/12");
        assert_eq!(notebook.kind, TransactionKind::Expense);
        assert_eq!(outcome.transactions[1].kind, TransactionKind::Income);
    }

    #[tokio::test]
    async fn reimport_is_all_duplicates() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let first = p.run(csv_request(STATEMENT)).await.unwrap();
        let second = p.run(csv_request(STATEMENT)).await.unwrap();

        assert_eq!(second.report.duplicates, first.report.imported);
        assert_eq!(second.report.imported, 0);
        assert!(second.report.is_balanced());
        assert_eq!(p.store().len(), 3);
        assert!(second
            .rows
            .iter()
            .filter(|r| r.status == RowStatus::Duplicate)
            .count()
            == 3);
    }

    #[tokio::test]
    async fn repeated_rows_inside_a_batch_are_skipped() {
        let body = "Data;Descricao;Valor\n01/03/2024;Cafe;-5,00\n01/03/2024;Cafe;-5,00\n";
        let p = pipeline(MemoryStore::default(), no_rules());
        let outcome = p.run(csv_request(body)).await.unwrap();
        assert_eq!(outcome.report.skipped, 1);
        assert_eq!(outcome.report.imported, 1);
        assert!(outcome.report.is_balanced());
    }

    #[tokio::test]
    async fn preview_writes_nothing() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let outcome = p.preview(csv_request(STATEMENT)).await.unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.report.imported, 3);
        assert_eq!(p.store().len(), 0);
    }

    // ── Categorization ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn rules_assign_categories() {
        let rules = RuleSet {
            rules: vec![CategorizationRule {
                id: "r1".to_string(),
                user_id: user(),
                name: "Mercado".to_string(),
                priority: 1,
                enabled: true,
                match_type: RuleMatchType::Contains,
                pattern: "supermercado".to_string(),
                account_id: None,
                min_amount: None,
                max_amount: None,
                category_id: CategoryId::from("groceries"),
            }],
        };
        let p = pipeline(MemoryStore::default(), rules);
        let outcome = p.run(csv_request(STATEMENT)).await.unwrap();
        assert_eq!(outcome.transactions[0].category_id, Some(CategoryId::from("groceries")));
        assert_eq!(outcome.transactions[1].category_id, None);
    }

    #[tokio::test]
    async fn rule_source_failure_aborts_before_commit() {
        let p = pipeline(MemoryStore::default(), FailingRules);
        let err = p.run(csv_request(STATEMENT)).await.unwrap_err();
        assert_eq!(err.stage(), ImportStage::Categorizing);
        assert_eq!(p.store().len(), 0);
    }

    // ── Fatal errors ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unsupported_source_type_has_no_side_effects() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let request = ImportRequest::new(user(), "xlsx", b"whatever".to_vec()).with_account(checking());
        let err = p.run(request).await.unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedSourceType(ref s) if s == "xlsx"));
        assert_eq!(err.stage(), ImportStage::Parsing);
        assert_eq!(p.store().len(), 0);
    }

    #[tokio::test]
    async fn empty_document_is_unreadable() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let err = p.run(csv_request("  \n")).await.unwrap_err();
        assert!(matches!(err, ImportError::UnreadableDocument(_)));
    }

    #[tokio::test]
    async fn commit_failure_is_fatal() {
        let store = MemoryStore {
            fail_commit: true,
            ..Default::default()
        };
        let p = pipeline(store, no_rules());
        let err = p.run(csv_request(STATEMENT)).await.unwrap_err();
        assert_eq!(err.stage(), ImportStage::Committing);
        assert_eq!(p.store().len(), 0);
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rows_without_a_target_account_are_invalid() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let request = ImportRequest::new(user(), "csv", STATEMENT.as_bytes().to_vec());
        let outcome = p.run(request).await.unwrap();
        assert_eq!(outcome.report.valid_rows, 0);
        assert_eq!(outcome.report.invalid_rows, 4);
        assert!(outcome.report.is_balanced());
    }

    // ── OFX and reconciliation ───────────────────────────────────────────────

    const CARD_OFX: &str = "<OFX><CREDITCARDMSGSRSV1><CCSTMTRS>
<CCACCTFROM><ACCTID>5555</CCACCTFROM>
<STMTTRN><DTPOSTED>20240310<TRNAMT>1500.00<FITID>c-1<MEMO>Pagamento recebido</STMTTRN>
<STMTTRN><DTPOSTED>20240305<TRNAMT>-120.55<FITID>c-2<MEMO>Restaurante</STMTTRN>
<STMTTRN><DTPOSTED>20240306<TRNAMT>-80.00<FITID>c-3<MEMO>Farmacia</STMTTRN>
</CCSTMTRS></CREDITCARDMSGSRSV1></OFX>";

    #[tokio::test]
    async fn card_payment_pairs_with_previously_imported_bank_debit() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let bank = "Data;Descricao;Valor\n10/03/2024;PAGTO FATURA NUBANK;-1.500,00\n";
        let first = p.run(csv_request(bank)).await.unwrap();
        assert_eq!(first.report.card_payment_not_converted, 1);

        let mut request = ImportRequest::new(user(), "ofx", CARD_OFX.as_bytes().to_vec());
        request
            .account_aliases
            .insert("5555".to_string(), AccountId::from("card"));
        let outcome = p.run(request).await.unwrap();

        assert_eq!(outcome.classification.document_type, DocumentType::CreditCardInvoice);
        assert_eq!(outcome.report.imported, 3);
        assert_eq!(outcome.report.transfer_created, 1);
        assert_eq!(outcome.report.card_payment_detected, 1);
        assert_eq!(outcome.report.card_payment_not_converted, 0);

        let payment = &outcome.transactions[0];
        assert_eq!(payment.account_id, AccountId::from("card"));
        let link = payment.transfer.as_ref().unwrap();
        assert_eq!(link.kind, TransferKind::CardPayment);
        assert_eq!(link.counterpart, Counterpart::Stored("row-0".to_string()));

        let stored_links = p.store().links.lock().unwrap().clone();
        assert_eq!(stored_links.len(), 1);
        assert_eq!(stored_links[0].transfer_key, link.transfer_key);
    }

    #[tokio::test]
    async fn reimporting_ofx_collides_on_fitid() {
        let p = pipeline(MemoryStore::default(), no_rules());
        let request = || {
            ImportRequest::new(user(), "ofx", CARD_OFX.as_bytes().to_vec())
                .with_account(AccountId::from("card"))
        };
        p.run(request()).await.unwrap();
        let again = p.run(request()).await.unwrap();
        assert_eq!(again.report.duplicates, 3);
        assert_eq!(again.report.imported, 0);
    }

    // ── PDF ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pdf_goes_through_the_extractor() {
        let text = "Banco Itau Extrato\n03/01/2024 PIX RECEBIDO 250,00\n04/01/2024 PADARIA -12,50\n";
        let p = pipeline(MemoryStore::default(), no_rules())
            .with_extractor(Box::new(StaticText::new(text)));
        let request = ImportRequest::new(user(), "pdf", b"%PDF-1.4".to_vec()).with_account(checking());
        let outcome = p.run(request).await.unwrap();
        assert_eq!(outcome.classification.issuer_profile, "itau");
        assert_eq!(outcome.report.imported, 2);
    }
}
