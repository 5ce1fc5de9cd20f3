//! Pairing of card payments and transfers between accounts.
//!
//! A candidate is a row whose description names a card payment or transfer.
//! Its counter-leg carries the exact opposite amount in a different account
//! within `date_window_days`. Rows of the current batch are searched before
//! legs already in storage.

use chrono::NaiveDate;
use extrato_core::{
    AccountId, Counterpart, Money, NormalizedTransaction, TransferKind, TransferLink, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::ReconcileConfig;
use crate::fingerprint::create_transfer_key_hash;
use crate::util::contains_words;

/// What storage is asked for: unlinked legs of `amount` outside
/// `exclude_account` dated within `[date_from, date_to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterLegQuery {
    pub exclude_account: AccountId,
    pub amount: Money,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// A persisted transaction that may close a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLeg {
    pub id: String,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub amount: Money,
    pub normalized_description: String,
    pub external_id: Option<String>,
    pub transfer_key: Option<String>,
}

/// A stored leg that must be updated to carry a new transfer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLink {
    pub stored_id: String,
    pub transfer_key: String,
    pub kind: TransferKind,
    /// Index of the batch row it was paired with.
    pub batch_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub stored_links: Vec<StoredLink>,
    pub transfer_created: usize,
    pub card_payment_detected: usize,
    pub card_payment_not_converted: usize,
    /// Batch indices of card-payment candidates left without a counter-leg.
    pub unresolved: Vec<usize>,
}

enum Leg<'a> {
    Batch(usize),
    Stored(&'a StoredLeg),
}

pub struct TransferMatcher {
    config: ReconcileConfig,
}

impl Default for TransferMatcher {
    fn default() -> Self {
        Self::new(ReconcileConfig::default())
    }
}

impl TransferMatcher {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    /// Card-payment keywords take precedence over transfer keywords.
    pub fn detect(&self, normalized_description: &str) -> Option<TransferKind> {
        let has_any = |keywords: &[String]| {
            keywords
                .iter()
                .any(|k| contains_words(normalized_description, k))
        };
        if has_any(&self.config.card_payment_keywords) {
            Some(TransferKind::CardPayment)
        } else if has_any(&self.config.transfer_keywords) {
            Some(TransferKind::Transfer)
        } else {
            None
        }
    }

    fn within_window(&self, a: NaiveDate, b: NaiveDate) -> Option<u64> {
        let days = (a - b).num_days().unsigned_abs();
        (days <= u64::from(self.config.date_window_days)).then_some(days)
    }

    fn candidates(&self, transactions: &[NormalizedTransaction]) -> Vec<(usize, TransferKind)> {
        transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.transfer.is_none() && !tx.amount.is_zero())
            .filter_map(|(i, tx)| self.detect(&tx.normalized_description).map(|kind| (i, kind)))
            .collect()
    }

    /// Storage lookups needed for every candidate in the batch.
    pub fn counter_leg_queries(&self, transactions: &[NormalizedTransaction]) -> Vec<CounterLegQuery> {
        let window = chrono::Duration::days(i64::from(self.config.date_window_days));
        self.candidates(transactions)
            .into_iter()
            .map(|(i, _)| {
                let tx = &transactions[i];
                CounterLegQuery {
                    exclude_account: tx.account_id.clone(),
                    amount: -tx.amount,
                    date_from: tx.date.checked_sub_signed(window).unwrap_or(NaiveDate::MIN),
                    date_to: tx.date.checked_add_signed(window).unwrap_or(NaiveDate::MAX),
                }
            })
            .collect()
    }

    fn find_in_batch(
        &self,
        transactions: &[NormalizedTransaction],
        index: usize,
        claimed: &HashSet<usize>,
    ) -> Option<usize> {
        let tx = &transactions[index];
        transactions
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != index
                    && !claimed.contains(j)
                    && other.transfer.is_none()
                    && other.account_id != tx.account_id
                    && other.amount == -tx.amount
            })
            .filter_map(|(j, other)| self.within_window(tx.date, other.date).map(|d| (d, j)))
            .min()
            .map(|(_, j)| j)
    }

    fn find_stored<'a>(
        &self,
        tx: &NormalizedTransaction,
        stored: &'a [StoredLeg],
        claimed: &HashSet<&str>,
    ) -> Option<&'a StoredLeg> {
        stored
            .iter()
            .enumerate()
            .filter(|(_, leg)| {
                leg.transfer_key.is_none()
                    && !claimed.contains(leg.id.as_str())
                    && leg.account_id != tx.account_id
                    && leg.amount == -tx.amount
            })
            .filter_map(|(pos, leg)| self.within_window(tx.date, leg.date).map(|d| (d, pos, leg)))
            .min_by_key(|(d, pos, _)| (*d, *pos))
            .map(|(_, _, leg)| leg)
    }

    /// Link pairs in place and report what was found.
    pub fn reconcile(
        &self,
        user_id: &UserId,
        transactions: &mut [NormalizedTransaction],
        stored: &[StoredLeg],
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut claimed_batch: HashSet<usize> = HashSet::new();
        let mut claimed_stored: HashSet<&str> = HashSet::new();

        for (index, kind) in self.candidates(transactions) {
            if claimed_batch.contains(&index) {
                continue;
            }

            let leg = self
                .find_in_batch(transactions, index, &claimed_batch)
                .map(Leg::Batch)
                .or_else(|| {
                    self.find_stored(&transactions[index], stored, &claimed_stored)
                        .map(Leg::Stored)
                });

            let Some(leg) = leg else {
                if kind == TransferKind::CardPayment {
                    outcome.card_payment_not_converted += 1;
                    outcome.unresolved.push(index);
                    tracing::warn!(
                        line = transactions[index].line,
                        amount = %transactions[index].amount,
                        "card payment without a counter-leg, kept as a regular transaction"
                    );
                }
                continue;
            };

            claimed_batch.insert(index);
            let tx = &transactions[index];
            let (counter_account, counter_date, counter_amount, counter_desc, counter_ext, counter_kind) =
                match &leg {
                    Leg::Batch(j) => {
                        let other = &transactions[*j];
                        (
                            other.account_id.clone(),
                            other.date,
                            other.amount,
                            other.normalized_description.clone(),
                            other.external_id.clone(),
                            self.detect(&other.normalized_description),
                        )
                    }
                    Leg::Stored(s) => (
                        s.account_id.clone(),
                        s.date,
                        s.amount,
                        s.normalized_description.clone(),
                        s.external_id.clone(),
                        self.detect(&s.normalized_description),
                    ),
                };
            let kind = if kind == TransferKind::CardPayment
                || counter_kind == Some(TransferKind::CardPayment)
            {
                TransferKind::CardPayment
            } else {
                TransferKind::Transfer
            };

            let transfer_key = if tx.amount.is_negative() {
                create_transfer_key_hash(
                    user_id,
                    tx.date,
                    tx.amount,
                    &tx.normalized_description,
                    &tx.account_id,
                    &counter_account,
                    tx.external_id.as_deref(),
                )
            } else {
                create_transfer_key_hash(
                    user_id,
                    counter_date,
                    counter_amount,
                    &counter_desc,
                    &counter_account,
                    &tx.account_id,
                    counter_ext.as_deref(),
                )
            };

            let counterpart = match leg {
                Leg::Batch(j) => {
                    claimed_batch.insert(j);
                    transactions[j].transfer = Some(TransferLink {
                        transfer_key: transfer_key.clone(),
                        kind,
                        counterpart: Counterpart::InBatch(index),
                    });
                    Counterpart::InBatch(j)
                }
                Leg::Stored(s) => {
                    claimed_stored.insert(s.id.as_str());
                    outcome.stored_links.push(StoredLink {
                        stored_id: s.id.clone(),
                        transfer_key: transfer_key.clone(),
                        kind,
                        batch_index: index,
                    });
                    Counterpart::Stored(s.id.clone())
                }
            };
            transactions[index].transfer = Some(TransferLink {
                transfer_key,
                kind,
                counterpart,
            });

            outcome.transfer_created += 1;
            if kind == TransferKind::CardPayment {
                outcome.card_payment_detected += 1;
            }
        }

        outcome
    }
}
