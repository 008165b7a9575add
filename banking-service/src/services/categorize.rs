//! Categorization engine: priority-ordered pattern rules over transactions.
//!
//! Rules compile once per batch into a tagged pattern (literal alternation or
//! regex) and are scanned in (priority, rule_id) order; the first match wins.
//! An invalid regex disables that rule for the batch, never the engine.

use crate::models::{BankTransaction, CategoryRule, RuleField};
use crate::services::metrics::{record_categorization, INVALID_RULE_PATTERNS};
use crate::services::store::BankingStore;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Label reported for transactions no rule matched.
pub const UNCATEGORIZED: &str = "Sin categorizar";

#[derive(Debug)]
enum CompiledPattern {
    /// `|`-delimited alternatives, matched as case-insensitive substrings.
    Literal(Vec<String>),
    Regex(regex::Regex),
}

/// A rule whose pattern compiled successfully.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule_id: Uuid,
    pub field: RuleField,
    pub category: String,
    pub priority: i32,
    pattern: CompiledPattern,
}

impl CompiledRule {
    fn matches(&self, haystack: &str) -> bool {
        match &self.pattern {
            CompiledPattern::Literal(alternatives) => {
                let lower = haystack.to_lowercase();
                alternatives.iter().any(|alt| lower.contains(alt))
            }
            CompiledPattern::Regex(re) => re.is_match(haystack),
        }
    }
}

/// The transaction fields a rule can match on.
pub trait Categorizable {
    fn match_field(&self, field: RuleField) -> &str;
}

/// Minimal view used while transactions are still in flight (pre-insert).
pub struct MatchFields<'a> {
    pub description: &'a str,
    pub reference: Option<&'a str>,
    pub counterparty: Option<&'a str>,
}

impl Categorizable for MatchFields<'_> {
    fn match_field(&self, field: RuleField) -> &str {
        match field {
            RuleField::Description => self.description,
            RuleField::Reference => self.reference.unwrap_or(""),
            RuleField::Counterparty => self.counterparty.unwrap_or(""),
        }
    }
}

impl Categorizable for BankTransaction {
    fn match_field(&self, field: RuleField) -> &str {
        match field {
            RuleField::Description => &self.description,
            RuleField::Reference => self.reference.as_deref().unwrap_or(""),
            RuleField::Counterparty => self.counterparty_name.as_deref().unwrap_or(""),
        }
    }
}

/// Compile the active rules of a company in evaluation order.
///
/// Invalid regex patterns are logged, counted and skipped.
pub fn compile_rules(mut rules: Vec<CategoryRule>) -> Vec<CompiledRule> {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    rules
        .into_iter()
        .filter(|r| r.is_active)
        .filter_map(|r| {
            let pattern = if r.is_regex {
                match regex::Regex::new(&r.pattern) {
                    Ok(re) => CompiledPattern::Regex(re),
                    Err(e) => {
                        warn!(
                            rule_id = %r.rule_id,
                            pattern = %r.pattern,
                            error = %e,
                            "Skipping rule with invalid regex"
                        );
                        INVALID_RULE_PATTERNS
                            .with_label_values(&[&r.company_id.to_string()])
                            .inc();
                        return None;
                    }
                }
            } else {
                CompiledPattern::Literal(
                    r.pattern
                        .split('|')
                        .map(|alt| alt.trim().to_lowercase())
                        .filter(|alt| !alt.is_empty())
                        .collect(),
                )
            };
            Some(CompiledRule {
                rule_id: r.rule_id,
                field: r.field(),
                category: r.category,
                priority: r.priority,
                pattern,
            })
        })
        .collect()
}

/// First matching rule's category, or `None`. Pure over the compiled set.
pub fn categorize<T: Categorizable>(subject: &T, rules: &[CompiledRule]) -> Option<String> {
    for rule in rules {
        if rule.matches(subject.match_field(rule.field)) {
            record_categorization("matched");
            return Some(rule.category.clone());
        }
    }
    record_categorization("unmatched");
    None
}

/// Service wrapper owning the store side of categorization.
pub struct CategorizationEngine {
    store: Arc<dyn BankingStore>,
}

impl CategorizationEngine {
    pub fn new(store: Arc<dyn BankingStore>) -> Self {
        Self { store }
    }

    /// Compiled active rule set for a company, in evaluation order.
    pub async fn rules_for(&self, company_id: Uuid) -> Result<Vec<CompiledRule>, AppError> {
        let rules = self.store.list_rules(company_id, true).await?;
        Ok(compile_rules(rules))
    }

    /// Manual override: sets the category and permanently excludes the
    /// transaction from automatic re-evaluation.
    #[instrument(skip(self))]
    pub async fn categorize_manually(
        &self,
        transaction_id: Uuid,
        category: &str,
    ) -> Result<BankTransaction, AppError> {
        let existing = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;

        self.store
            .set_transaction_category(transaction_id, category, true)
            .await?;
        record_categorization("manual");

        Ok(BankTransaction {
            category: Some(category.to_string()),
            is_manual_category: true,
            ..existing
        })
    }

    /// Validate a rule pattern at CRUD time so a broken regex is rejected at
    /// the door rather than silently skipped during matching.
    pub fn validate_pattern(pattern: &str, is_regex: bool) -> Result<(), AppError> {
        if pattern.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Rule pattern must not be empty"
            )));
        }
        if is_regex {
            regex::Regex::new(pattern)
                .map_err(|e| AppError::InvalidPattern(e.to_string()))?;
        }
        Ok(())
    }
}
