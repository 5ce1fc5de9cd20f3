use extrato_core::{AccountId, CategorizationRule, CategoryId, Money, RuleMatchType};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::normalize_description;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Failed to parse rules TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// What a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct RuleCandidate<'a> {
    pub description: &'a str,
    pub normalized_description: &'a str,
    pub amount: Money,
    pub account_id: Option<&'a AccountId>,
}

/// Rules as written in a TOML file: `[[rules]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<CategorizationRule>,
}

impl RuleSet {
    pub fn from_toml(content: &str) -> Result<Self, RulesError> {
        Ok(toml::from_str(content)?)
    }
}

/// Internal pairing of a rule with its precompiled regex (if applicable).
struct CompiledRule {
    rule: CategorizationRule,
    compiled_regex: Option<Regex>,
    normalized_pattern: String,
}

impl CompiledRule {
    fn compile(rule: CategorizationRule) -> Self {
        let compiled_regex = match rule.match_type {
            RuleMatchType::Regex => compile_pattern(&rule),
            RuleMatchType::Contains => None,
        };
        let normalized_pattern = normalize_description(&rule.pattern);
        Self {
            rule,
            compiled_regex,
            normalized_pattern,
        }
    }

    fn matches(&self, candidate: &RuleCandidate<'_>) -> bool {
        let rule = &self.rule;

        // An unknown candidate account does not exclude account-scoped rules.
        if let (Some(scope), Some(account)) = (&rule.account_id, candidate.account_id) {
            if scope != account {
                return false;
            }
        }

        let amount = candidate.amount.abs();
        if rule.min_amount.is_some_and(|min| amount < min.abs()) {
            return false;
        }
        if rule.max_amount.is_some_and(|max| amount > max.abs()) {
            return false;
        }

        match rule.match_type {
            RuleMatchType::Contains => {
                !self.normalized_pattern.is_empty()
                    && normalize_description(candidate.normalized_description)
                        .contains(&self.normalized_pattern)
            }
            RuleMatchType::Regex => self.compiled_regex.as_ref().is_some_and(|re| {
                re.is_match(candidate.description) || re.is_match(candidate.normalized_description)
            }),
        }
    }
}

fn compile_pattern(rule: &CategorizationRule) -> Option<Regex> {
    match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(rule_id = %rule.id, error = %e, "invalid rule regex, rule never matches");
            None
        }
    }
}

/// A user's rules, enabled only, in evaluation order.
pub struct CategoryRuleEngine {
    rules: Vec<CompiledRule>,
}

impl CategoryRuleEngine {
    pub fn new(rules: Vec<CategorizationRule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(CompiledRule::compile)
            .collect();
        // Lowest priority value first; equal priorities keep input order.
        compiled.sort_by_key(|cr| cr.rule.priority);
        Self { rules: compiled }
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, RulesError> {
        Ok(Self::new(RuleSet::from_toml(toml_content)?.rules))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find_matching_rule(&self, candidate: &RuleCandidate<'_>) -> Option<&CategorizationRule> {
        self.rules
            .iter()
            .find(|cr| cr.matches(candidate))
            .map(|cr| &cr.rule)
    }

    pub fn resolve(&self, candidate: &RuleCandidate<'_>) -> Option<CategoryId> {
        self.find_matching_rule(candidate)
            .map(|rule| rule.category_id.clone())
    }
}

/// First matching category for `candidate`. Disabled rules are skipped and
/// the result does not depend on the order of `rules`.
pub fn resolve_rule_category(
    rules: &[CategorizationRule],
    candidate: &RuleCandidate<'_>,
) -> Option<CategoryId> {
    CategoryRuleEngine::new(rules.to_vec()).resolve(candidate)
}

/// Whether one rule matches, ignoring its `enabled` flag.
pub fn matches_rule(rule: &CategorizationRule, candidate: &RuleCandidate<'_>) -> bool {
    CompiledRule::compile(rule.clone()).matches(candidate)
}
