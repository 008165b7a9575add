//! Persistence seam for banking-service.
//!
//! The engines operate against this trait rather than a concrete pool so the
//! services stay injectable and testable; `Database` is the Postgres
//! implementation used in production.

use crate::models::{
    BankAccount, BankConnection, BankTransaction, CategoryRule, ConnectionStatus, ConsentRecord,
    ConsentStatus, NewBankAccount, NewBankTransaction, ProviderConfig, RuleField,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use uuid::Uuid;

/// Partial update for a category rule; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub is_regex: Option<bool>,
    pub field: Option<RuleField>,
    pub category: Option<String>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

#[async_trait]
pub trait BankingStore: Send + Sync {
    /// Liveness probe against the backing storage.
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Provider configuration
    // ------------------------------------------------------------------
    async fn upsert_provider_config(&self, cfg: &ProviderConfig) -> Result<(), AppError>;
    async fn get_provider_config(&self, company_id: Uuid)
        -> Result<Option<ProviderConfig>, AppError>;

    // ------------------------------------------------------------------
    // Consents
    // ------------------------------------------------------------------
    async fn create_consent(&self, consent: &ConsentRecord) -> Result<(), AppError>;
    async fn get_consent(&self, consent_id: &str) -> Result<Option<ConsentRecord>, AppError>;
    async fn update_consent_status(
        &self,
        consent_id: &str,
        status: ConsentStatus,
    ) -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------
    async fn create_connection(&self, connection: &BankConnection) -> Result<(), AppError>;
    async fn get_connection(&self, connection_id: Uuid)
        -> Result<Option<BankConnection>, AppError>;
    async fn list_connections(&self, company_id: Uuid) -> Result<Vec<BankConnection>, AppError>;
    /// Guarded status update: the row changes only while it still holds
    /// `from`. Returns whether a transition happened, which keeps
    /// `refresh_status` idempotent under races.
    async fn set_connection_status(
        &self,
        connection_id: Uuid,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) -> Result<bool, AppError>;
    /// Non-terminal connections whose consent validity date has passed.
    async fn list_overdue_connections(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<BankConnection>, AppError>;

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------
    async fn upsert_accounts(
        &self,
        connection_id: Uuid,
        accounts: &[NewBankAccount],
    ) -> Result<(), AppError>;
    async fn get_account(&self, account_id: Uuid) -> Result<Option<BankAccount>, AppError>;
    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankAccount>, AppError>;
    /// Active accounts under the company's active connections.
    async fn list_company_accounts(&self, company_id: Uuid)
        -> Result<Vec<BankAccount>, AppError>;
    async fn deactivate_accounts(&self, connection_id: Uuid) -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Sync bookkeeping
    // ------------------------------------------------------------------
    async fn count_sync_calls(
        &self,
        connection_id: Uuid,
        day: NaiveDate,
    ) -> Result<i64, AppError>;
    async fn record_sync_call(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;
    async fn existing_dedup_keys(
        &self,
        account_id: Uuid,
        keys: &[String],
    ) -> Result<HashSet<String>, AppError>;
    /// Atomic unit of a sync: one account's balances, its new transactions
    /// and `last_sync_utc` commit together or not at all. Returns the number
    /// of transactions inserted.
    async fn commit_sync_batch(
        &self,
        account_id: Uuid,
        balance: Decimal,
        available_balance: Decimal,
        transactions: &[NewBankTransaction],
        synced_at: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------
    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError>;
    async fn list_account_transactions(
        &self,
        account_id: Uuid,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, AppError>;
    async fn recent_company_transactions(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> Result<Vec<BankTransaction>, AppError>;
    /// Debit (negative-amount) transactions across the company's active
    /// connections, for the category breakdown.
    async fn company_expense_transactions(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError>;
    async fn set_transaction_category(
        &self,
        transaction_id: Uuid,
        category: &str,
        manual: bool,
    ) -> Result<(), AppError>;
    async fn link_invoice(&self, transaction_id: Uuid, invoice_id: Uuid) -> Result<(), AppError>;
    async fn invoice_exists(&self, invoice_id: Uuid) -> Result<bool, AppError>;

    // ------------------------------------------------------------------
    // Category rules
    // ------------------------------------------------------------------
    async fn create_rule(&self, rule: &CategoryRule) -> Result<(), AppError>;
    async fn update_rule(
        &self,
        company_id: Uuid,
        rule_id: Uuid,
        update: RuleUpdate,
    ) -> Result<Option<CategoryRule>, AppError>;
    async fn list_rules(
        &self,
        company_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<CategoryRule>, AppError>;
}
