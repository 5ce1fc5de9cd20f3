use serde::{Deserialize, Serialize};

use super::account::{AccountId, CategoryId, UserId};
use super::money::Money;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleMatchType {
    #[default]
    Contains,
    Regex,
}

impl RuleMatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleMatchType::Contains => "contains",
            RuleMatchType::Regex => "regex",
        }
    }
}

impl std::str::FromStr for RuleMatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contains" => Ok(RuleMatchType::Contains),
            "regex" => Ok(RuleMatchType::Regex),
            other => Err(format!("Unknown match type: '{other}'")),
        }
    }
}

/// A user-owned categorization rule. Lower `priority` values are evaluated first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizationRule {
    pub id: String,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub match_type: RuleMatchType,
    pub pattern: String,
    /// Restricts the rule to one account when set.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Inclusive bounds on the absolute amount.
    #[serde(default)]
    pub min_amount: Option<Money>,
    #[serde(default)]
    pub max_amount: Option<Money>,
    pub category_id: CategoryId,
}

fn enabled_by_default() -> bool {
    true
}
