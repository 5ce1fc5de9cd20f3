pub mod account;
pub mod money;
pub mod report;
pub mod rule;
pub mod transaction;

pub use account::{AccountId, CategoryId, UserId};
pub use money::Money;
pub use report::{ImportCommitReport, RowOutcome, RowStatus};
pub use rule::{CategorizationRule, RuleMatchType};
pub use transaction::{
    Counterpart, DocumentClassification, DocumentType, InstallmentInfo, NormalizedTransaction,
    ParsedDraftTransaction, SourceType, TransactionKind, TransferKind, TransferLink,
};
