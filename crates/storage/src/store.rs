use async_trait::async_trait;
use chrono::NaiveDate;
use extrato_core::{
    AccountId, CategorizationRule, CategoryId, Money, NormalizedTransaction, TransactionKind,
    TransferKind, UserId,
};
use extrato_import::{CommitBatch, CounterLegQuery, ImportStore, RulesSource, StoredLeg};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::{HashMap, HashSet};

use crate::db::DbPool;
use crate::rules::list_enabled_rules;
use crate::StorageError;

// Stays well under SQLite's bound-parameter limit.
const FINGERPRINT_CHUNK: usize = 500;

/// A transaction row as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTransaction {
    pub id: i64,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Money,
    pub fingerprint: String,
    pub category_id: Option<CategoryId>,
    pub installment_marker: Option<String>,
    pub transfer_key: Option<String>,
    pub transfer_kind: Option<String>,
}

/// SQLite-backed storage and rules collaborator.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn get_transactions(&self, user_id: &UserId) -> Result<Vec<StoredTransaction>, StorageError> {
        get_transactions(&self.pool, user_id).await
    }
}

fn kind_str(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Income => "income",
        TransactionKind::Expense => "expense",
    }
}

fn transfer_kind_str(kind: TransferKind) -> &'static str {
    match kind {
        TransferKind::CardPayment => "card_payment",
        TransferKind::Transfer => "transfer",
    }
}

pub async fn get_transactions(
    pool: &DbPool,
    user_id: &UserId,
) -> Result<Vec<StoredTransaction>, StorageError> {
    let rows = sqlx::query_as::<
        _,
        (
            i64,
            String,
            NaiveDate,
            String,
            i64,
            String,
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
        ),
    >(
        "SELECT id, account_id, date, description, amount_cents, fingerprint, category_id, \
         installment_current, installment_total, transfer_key, transfer_kind \
         FROM transactions WHERE user_id = ? ORDER BY date, id",
    )
    .bind(user_id.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| StoredTransaction {
            id: r.0,
            account_id: AccountId::new(r.1),
            date: r.2,
            description: r.3,
            amount: Money::from_cents(r.4),
            fingerprint: r.5,
            category_id: r.6.map(CategoryId::new),
            installment_marker: r.7.zip(r.8).map(|(current, total)| format!("{current}/{total}")),
            transfer_key: r.9,
            transfer_kind: r.10,
        })
        .collect())
}

#[async_trait]
impl ImportStore for SqliteStore {
    type Error = StorageError;

    async fn find_fingerprints(
        &self,
        user_id: &UserId,
        fingerprints: &[String],
    ) -> Result<HashSet<String>, StorageError> {
        let mut found = HashSet::new();
        for chunk in fingerprints.chunks(FINGERPRINT_CHUNK) {
            let mut query: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("SELECT fingerprint FROM transactions WHERE user_id = ");
            query.push_bind(user_id.as_str().to_string());
            query.push(" AND fingerprint IN (");
            let mut values = query.separated(", ");
            for fingerprint in chunk {
                values.push_bind(fingerprint.clone());
            }
            values.push_unseparated(")");

            let rows: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
            found.extend(rows);
        }
        Ok(found)
    }

    async fn find_counter_legs(
        &self,
        user_id: &UserId,
        queries: &[CounterLegQuery],
    ) -> Result<Vec<StoredLeg>, StorageError> {
        let mut legs: HashMap<i64, StoredLeg> = HashMap::new();
        for query in queries {
            let rows = sqlx::query_as::<_, (i64, String, NaiveDate, i64, String, Option<String>)>(
                "SELECT id, account_id, date, amount_cents, normalized_description, external_id \
                 FROM transactions \
                 WHERE user_id = ? AND transfer_key IS NULL AND account_id <> ? \
                   AND amount_cents = ? AND date BETWEEN ? AND ? \
                 ORDER BY date, id",
            )
            .bind(user_id.as_str())
            .bind(query.exclude_account.as_str())
            .bind(query.amount.to_cents())
            .bind(query.date_from)
            .bind(query.date_to)
            .fetch_all(&self.pool)
            .await?;

            for r in rows {
                legs.entry(r.0).or_insert_with(|| StoredLeg {
                    id: r.0.to_string(),
                    account_id: AccountId::new(r.1),
                    date: r.2,
                    amount: Money::from_cents(r.3),
                    normalized_description: r.4,
                    external_id: r.5,
                    transfer_key: None,
                });
            }
        }

        let mut legs: Vec<(i64, StoredLeg)> = legs.into_iter().collect();
        legs.sort_by_key(|(id, _)| *id);
        Ok(legs.into_iter().map(|(_, leg)| leg).collect())
    }

    async fn commit_batch(&self, user_id: &UserId, batch: CommitBatch<'_>) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for row in batch.transactions {
            let installment = row.installment.as_ref();
            let transfer = row.transfer.as_ref();
            sqlx::query(
                r#"
                INSERT INTO transactions
                    (user_id, account_id, date, description, normalized_description, amount_cents,
                     kind, external_id, fingerprint, category_id, installment_current,
                     installment_total, installment_base, transfer_key, transfer_kind, source_type)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id.as_str())
            .bind(row.account_id.as_str())
            .bind(row.date)
            .bind(&row.description)
            .bind(&row.normalized_description)
            .bind(row.amount.to_cents())
            .bind(kind_str(row.kind))
            .bind(row.external_id.as_deref())
            .bind(&row.fingerprint)
            .bind(row.category_id.as_ref().map(|c| c.as_str()))
            .bind(installment.map(|i| i64::from(i.current_installment)))
            .bind(installment.map(|i| i64::from(i.total_installments)))
            .bind(installment.map(|i| i.base_description.as_str()))
            .bind(transfer.map(|t| t.transfer_key.as_str()))
            .bind(transfer.map(|t| transfer_kind_str(t.kind)))
            .bind(row.source_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for link in batch.stored_links {
            let id: i64 = link
                .stored_id
                .parse()
                .map_err(|_| StorageError::InvalidRow(format!("transaction id '{}'", link.stored_id)))?;
            let updated = sqlx::query(
                "UPDATE transactions SET transfer_key = ?, transfer_kind = ? \
                 WHERE id = ? AND user_id = ? AND transfer_key IS NULL",
            )
            .bind(&link.transfer_key)
            .bind(transfer_kind_str(link.kind))
            .bind(id)
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(StorageError::LegAlreadyLinked(link.stored_id.clone()));
            }
        }

        tx.commit().await?;
        tracing::debug!(
            rows = batch.transactions.len(),
            links = batch.stored_links.len(),
            "batch committed"
        );
        Ok(())
    }
}

#[async_trait]
impl RulesSource for SqliteStore {
    type Error = StorageError;

    async fn list_enabled_rules(&self, user_id: &UserId) -> Result<Vec<CategorizationRule>, StorageError> {
        list_enabled_rules(&self.pool, user_id).await
    }
}

/// Persist pre-built rows outside the orchestrator.
pub async fn insert_transactions(
    store: &SqliteStore,
    user_id: &UserId,
    transactions: &[NormalizedTransaction],
) -> Result<(), StorageError> {
    store
        .commit_batch(
            user_id,
            CommitBatch {
                transactions,
                stored_links: &[],
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_in_memory_db;
    use crate::rules::save_categorization_rule;
    use extrato_core::{RuleMatchType, SourceType};
    use extrato_import::{ImportConfig, ImportPipeline, ImportRequest, StoredLink};

    fn user() -> UserId {
        UserId::from("u1")
    }

    async fn store() -> SqliteStore {
        SqliteStore::new(create_in_memory_db().await.unwrap())
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn row(account: &str, day: u32, cents: i64, fingerprint: &str) -> NormalizedTransaction {
        let amount = Money::from_cents(cents);
        NormalizedTransaction {
            user_id: user(),
            account_id: AccountId::from(account),
            date: date(day),
            description: "Row".to_string(),
            normalized_description: "ROW".to_string(),
            amount,
            kind: TransactionKind::from_amount(amount),
            external_id: None,
            fingerprint: fingerprint.to_string(),
            category_id: None,
            installment: None,
            transfer: None,
            source_type: SourceType::Csv,
            line: 2,
        }
    }

    // ── Fingerprints ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn finds_only_existing_fingerprints_of_the_user() {
        let s = store().await;
        insert_transactions(&s, &user(), &[row("checking", 1, -100, "fp-a"), row("checking", 2, -200, "fp-b")])
            .await
            .unwrap();

        let asked = vec!["fp-a".to_string(), "fp-x".to_string()];
        let found = s.find_fingerprints(&user(), &asked).await.unwrap();
        assert_eq!(found, HashSet::from(["fp-a".to_string()]));

        let other = s.find_fingerprints(&UserId::from("u2"), &asked).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn large_fingerprint_lists_are_chunked() {
        let s = store().await;
        insert_transactions(&s, &user(), &[row("checking", 1, -100, "fp-1200")])
            .await
            .unwrap();
        let asked: Vec<String> = (0..1500).map(|i| format!("fp-{i}")).collect();
        let found = s.find_fingerprints(&user(), &asked).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    // ── Atomic commit ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_fingerprint_rolls_back_the_whole_batch() {
        let s = store().await;
        insert_transactions(&s, &user(), &[row("checking", 1, -100, "fp-a")])
            .await
            .unwrap();

        let err = insert_transactions(
            &s,
            &user(),
            &[row("checking", 2, -200, "fp-new"), row("checking", 1, -100, "fp-a")],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));
        assert_eq!(s.get_transactions(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn racing_commits_cannot_duplicate_a_fingerprint() {
        let s = store().await;
        let asked = vec!["fp-race".to_string()];

        // Both imports check before either commits.
        assert!(s.find_fingerprints(&user(), &asked).await.unwrap().is_empty());
        assert!(s.find_fingerprints(&user(), &asked).await.unwrap().is_empty());

        insert_transactions(&s, &user(), &[row("checking", 3, -990, "fp-race")])
            .await
            .unwrap();
        let second = insert_transactions(
            &s,
            &user(),
            &[row("checking", 4, -100, "fp-other"), row("checking", 3, -990, "fp-race")],
        )
        .await;

        assert!(matches!(second, Err(StorageError::Sqlx(_))));
        let rows = s.get_transactions(&user()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fingerprint, "fp-race");
    }

    #[tokio::test]
    async fn stored_links_are_applied_once() {
        let s = store().await;
        insert_transactions(&s, &user(), &[row("checking", 10, -150_000, "fp-debit")])
            .await
            .unwrap();
        let stored = s.get_transactions(&user()).await.unwrap();
        let link = StoredLink {
            stored_id: stored[0].id.to_string(),
            transfer_key: "key-1".to_string(),
            kind: TransferKind::CardPayment,
            batch_index: 0,
        };
        let payment = row("card", 10, 150_000, "fp-credit");

        s.commit_batch(
            &user(),
            CommitBatch {
                transactions: std::slice::from_ref(&payment),
                stored_links: std::slice::from_ref(&link),
            },
        )
        .await
        .unwrap();
        let rows = s.get_transactions(&user()).await.unwrap();
        assert_eq!(rows[0].transfer_key.as_deref(), Some("key-1"));
        assert_eq!(rows[0].transfer_kind.as_deref(), Some("card_payment"));

        let again = row("card", 11, 150_000, "fp-credit-2");
        let err = s
            .commit_batch(
                &user(),
                CommitBatch {
                    transactions: std::slice::from_ref(&again),
                    stored_links: std::slice::from_ref(&link),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LegAlreadyLinked(_)));
        assert_eq!(s.get_transactions(&user()).await.unwrap().len(), 2);
    }

    // ── Counter legs ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn counter_legs_match_amount_window_and_account() {
        let s = store().await;
        insert_transactions(
            &s,
            &user(),
            &[
                row("checking", 10, -5000, "a"),
                row("checking", 14, -5000, "b"),
                row("card", 10, -5000, "c"),
                row("checking", 10, -4999, "d"),
            ],
        )
        .await
        .unwrap();

        let query = CounterLegQuery {
            exclude_account: AccountId::from("card"),
            amount: Money::from_cents(-5000),
            date_from: date(9),
            date_to: date(11),
        };
        let legs = s.find_counter_legs(&user(), &[query.clone(), query]).await.unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].account_id, AccountId::from("checking"));
        assert_eq!(legs[0].date, date(10));
    }

    // ── End to end ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pipeline_over_sqlite() {
        let s = store().await;
        save_categorization_rule(
            s.pool(),
            &CategorizationRule {
                id: "r1".to_string(),
                user_id: user(),
                name: "Transport".to_string(),
                priority: 1,
                enabled: true,
                match_type: RuleMatchType::Regex,
                pattern: r"^uber".to_string(),
                account_id: None,
                min_amount: None,
                max_amount: None,
                category_id: CategoryId::from("transport"),
            },
        )
        .await
        .unwrap();

        let pipeline = ImportPipeline::new(s.clone(), s.clone(), ImportConfig::default());
        let body = "Data;Descricao;Valor\n01/03/2024;UBER *TRIP;-23,90\n02/03/2024;Padaria;-8,50\n";
        let request = || {
            ImportRequest::new(user(), "csv", body.as_bytes().to_vec())
                .with_account(AccountId::from("checking"))
        };

        let first = pipeline.run(request()).await.unwrap();
        assert_eq!(first.report.imported, 2);
        let second = pipeline.run(request()).await.unwrap();
        assert_eq!(second.report.duplicates, 2);
        assert_eq!(second.report.imported, 0);

        let rows = s.get_transactions(&user()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category_id, Some(CategoryId::from("transport")));
        assert_eq!(rows[0].amount, Money::from_cents(-2390));
        assert_eq!(rows[1].category_id, None);
    }
}
