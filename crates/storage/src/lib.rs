pub mod db;
pub mod rules;
pub mod store;

use thiserror::Error;

pub use db::{create_db, create_in_memory_db, DbPool};
pub use rules::{
    delete_categorization_rule, get_categorization_rules, list_enabled_rules,
    save_categorization_rule,
};
pub use store::{get_transactions, insert_transactions, SqliteStore, StoredTransaction};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
    #[error("Transaction {0} already belongs to a transfer")]
    LegAlreadyLinked(String),
}
