use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// A private database living as long as the pool. One connection, since every
/// `:memory:` connection opens its own database.
pub async fn create_in_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            normalized_description TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            kind TEXT NOT NULL,
            external_id TEXT,
            fingerprint TEXT NOT NULL,
            category_id TEXT,
            installment_current INTEGER,
            installment_total INTEGER,
            installment_base TEXT,
            transfer_key TEXT,
            transfer_kind TEXT,
            source_type TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (user_id, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_counter_leg
            ON transactions (user_id, amount_cents, date)
            WHERE transfer_key IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categorization_rules (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            match_type TEXT NOT NULL DEFAULT 'contains',
            pattern TEXT NOT NULL,
            account_id TEXT,
            min_amount_cents INTEGER,
            max_amount_cents INTEGER,
            category_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_rules_user
            ON categorization_rules (user_id, enabled, priority)
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("storage migrations applied");
    Ok(())
}
