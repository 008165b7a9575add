//! Read-only aggregation for the banking dashboard.

use crate::models::{BankAccount, BankTransaction};
use crate::services::categorize::UNCATEGORIZED;
use crate::services::store::BankingStore;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// How many recent transactions the dashboard shows.
const RECENT_LIMIT: i64 = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySpend {
    pub category: String,
    /// Absolute sum of the debits in this category.
    pub total: Decimal,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_accounts: usize,
    pub total_balance: Decimal,
    pub total_available_balance: Decimal,
    pub recent_transactions: Vec<BankTransaction>,
    pub expenses_by_category: Vec<CategorySpend>,
}

pub struct DashboardService {
    store: Arc<dyn BankingStore>,
}

impl DashboardService {
    pub fn new(store: Arc<dyn BankingStore>) -> Self {
        Self { store }
    }

    /// Aggregate over stored data only; never reaches out to the bank.
    #[instrument(skip(self), fields(company_id = %company_id))]
    pub async fn summary(&self, company_id: Uuid) -> Result<DashboardSummary, AppError> {
        let accounts = self.store.list_company_accounts(company_id).await?;
        let recent = self
            .store
            .recent_company_transactions(company_id, RECENT_LIMIT)
            .await?;
        let expenses = self.store.company_expense_transactions(company_id).await?;
        Ok(summarize(&accounts, recent, &expenses))
    }
}

/// Pure aggregation over already-loaded rows.
pub fn summarize(
    accounts: &[BankAccount],
    recent_transactions: Vec<BankTransaction>,
    expenses: &[BankTransaction],
) -> DashboardSummary {
    let total_balance: Decimal = accounts.iter().map(|a| a.balance).sum();
    let total_available_balance: Decimal = accounts.iter().map(|a| a.available_balance).sum();

    // BTreeMap keeps the breakdown in a stable order.
    let mut by_category: BTreeMap<String, (Decimal, usize)> = BTreeMap::new();
    for t in expenses.iter().filter(|t| t.amount < Decimal::ZERO) {
        let label = t
            .category
            .clone()
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        let entry = by_category.entry(label).or_insert((Decimal::ZERO, 0));
        entry.0 += t.amount.abs();
        entry.1 += 1;
    }

    DashboardSummary {
        total_accounts: accounts.len(),
        total_balance,
        total_available_balance,
        recent_transactions,
        expenses_by_category: by_category
            .into_iter()
            .map(|(category, (total, count))| CategorySpend {
                category,
                total,
                count,
            })
            .collect(),
    }
}
