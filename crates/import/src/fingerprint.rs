//! Content-addressed keys for deduplication and transfer pairing.

use chrono::NaiveDate;
use extrato_core::{AccountId, Money, SourceType, UserId};
use sha2::{Digest, Sha256};

const IMPORT_NAMESPACE: &str = "import:v1";
const TRANSFER_NAMESPACE: &str = "transfer:v1";

/// SHA-256 over length-prefixed fields, so no field value can shift bytes
/// into its neighbour.
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new(namespace: &str) -> Self {
        let mut hasher = FieldHasher(Sha256::new());
        hasher.field(namespace);
        hasher
    }

    fn field(&mut self, value: &str) -> &mut Self {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Trimmed and uppercased; `None` when nothing is left.
pub fn normalize_external_id(external_id: Option<&str>) -> Option<String> {
    external_id
        .map(|id| id.trim().to_uppercase())
        .filter(|id| !id.is_empty())
}

/// Dedup key of one imported transaction.
///
/// With a usable external id only `(user, account, external id)` is hashed,
/// so a bank correcting the amount or memo of a known `FITID` still collides.
/// Otherwise the key is the content tuple `(user, date, |amount|, normalized
/// description, account)`. The source format does not take part in the
/// digest: the same row exported as CSV and as OFX is one transaction.
pub fn create_imported_hash(
    user_id: &UserId,
    _source_type: SourceType,
    date: NaiveDate,
    amount: Money,
    normalized_description: &str,
    account_id: &AccountId,
    external_id: Option<&str>,
) -> String {
    let mut hasher = FieldHasher::new(IMPORT_NAMESPACE);
    match normalize_external_id(external_id) {
        Some(external_id) => {
            hasher
                .field("external")
                .field(user_id.as_str())
                .field(account_id.as_str())
                .field(&external_id);
        }
        None => {
            hasher
                .field("content")
                .field(user_id.as_str())
                .field(&date.format("%Y-%m-%d").to_string())
                .field(&amount.abs().to_fixed())
                .field(normalized_description)
                .field(account_id.as_str());
        }
    }
    hasher.finish()
}

/// Shared key of the two legs of a transfer, computed from the debit leg.
pub fn create_transfer_key_hash(
    user_id: &UserId,
    date: NaiveDate,
    amount: Money,
    normalized_description: &str,
    from_account_id: &AccountId,
    to_account_id: &AccountId,
    external_id: Option<&str>,
) -> String {
    let external_id = normalize_external_id(external_id).unwrap_or_default();
    let mut hasher = FieldHasher::new(TRANSFER_NAMESPACE);
    hasher
        .field(user_id.as_str())
        .field(&date.format("%Y-%m-%d").to_string())
        .field(&amount.abs().to_fixed())
        .field(normalized_description)
        .field(from_account_id.as_str())
        .field(to_account_id.as_str())
        .field(&external_id);
    hasher.finish()
}
