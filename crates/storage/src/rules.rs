use extrato_core::{AccountId, CategorizationRule, CategoryId, Money, RuleMatchType, UserId};

use crate::db::DbPool;
use crate::StorageError;

type RuleRow = (
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<i64>,
    String,
);

const RULE_COLUMNS: &str = "id, user_id, name, priority, enabled, match_type, pattern, account_id, \
     min_amount_cents, max_amount_cents, category_id";

/// Insert or replace a rule by id.
pub async fn save_categorization_rule(
    pool: &DbPool,
    rule: &CategorizationRule,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO categorization_rules
            (id, user_id, name, priority, enabled, match_type, pattern, account_id,
             min_amount_cents, max_amount_cents, category_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            name = excluded.name,
            priority = excluded.priority,
            enabled = excluded.enabled,
            match_type = excluded.match_type,
            pattern = excluded.pattern,
            account_id = excluded.account_id,
            min_amount_cents = excluded.min_amount_cents,
            max_amount_cents = excluded.max_amount_cents,
            category_id = excluded.category_id
        "#,
    )
    .bind(&rule.id)
    .bind(rule.user_id.as_str())
    .bind(&rule.name)
    .bind(rule.priority)
    .bind(rule.enabled)
    .bind(rule.match_type.as_str())
    .bind(&rule.pattern)
    .bind(rule.account_id.as_ref().map(|a| a.as_str()))
    .bind(rule.min_amount.map(Money::to_cents))
    .bind(rule.max_amount.map(Money::to_cents))
    .bind(rule.category_id.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// A user's enabled rules, lowest priority value first. Equal priorities come
/// back in the order the rules were first saved.
pub async fn list_enabled_rules(
    pool: &DbPool,
    user_id: &UserId,
) -> Result<Vec<CategorizationRule>, StorageError> {
    let rows = sqlx::query_as::<_, RuleRow>(&format!(
        "SELECT {RULE_COLUMNS} FROM categorization_rules \
         WHERE user_id = ? AND enabled = 1 ORDER BY priority, rowid"
    ))
    .bind(user_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(rule_from_row).collect()
}

pub async fn get_categorization_rules(
    pool: &DbPool,
    user_id: &UserId,
) -> Result<Vec<CategorizationRule>, StorageError> {
    let rows = sqlx::query_as::<_, RuleRow>(&format!(
        "SELECT {RULE_COLUMNS} FROM categorization_rules WHERE user_id = ? ORDER BY priority, rowid"
    ))
    .bind(user_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(rule_from_row).collect()
}

/// Returns whether a rule was deleted. Rules of other users are untouched.
pub async fn delete_categorization_rule(
    pool: &DbPool,
    user_id: &UserId,
    rule_id: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM categorization_rules WHERE id = ? AND user_id = ?")
        .bind(rule_id)
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn rule_from_row(r: RuleRow) -> Result<CategorizationRule, StorageError> {
    let match_type: RuleMatchType = r
        .5
        .parse()
        .map_err(|e: String| StorageError::InvalidRow(format!("rule {}: {e}", r.0)))?;
    Ok(CategorizationRule {
        id: r.0,
        user_id: UserId::new(r.1),
        name: r.2,
        priority: r.3 as i32,
        enabled: r.4 != 0,
        match_type,
        pattern: r.6,
        account_id: r.7.map(AccountId::new),
        min_amount: r.8.map(Money::from_cents),
        max_amount: r.9.map(Money::from_cents),
        category_id: CategoryId::new(r.10),
    })
}
