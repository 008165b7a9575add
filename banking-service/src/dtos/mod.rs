//! Request/response bodies for the banking REST surface.

use crate::models::{
    BankAccount, BankConnection, ConnectionStatus, ConsentAccess, ConsentStatus, RuleField,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Success envelope: `{ "success": true, "data": ... }`.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

// ============================================================================
// Provider configuration
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigRequest {
    pub company_id: Uuid,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Config echo without the secret.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigResponse {
    pub company_id: Uuid,
    pub api_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub mtls_configured: bool,
}

// ============================================================================
// Consents / connections
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsentRequest {
    pub company_id: Uuid,
    /// Display name for the resulting connection.
    pub name: String,
    pub provider: String,
    pub access: ConsentAccess,
    #[serde(default = "default_recurring")]
    pub recurring_indicator: bool,
    pub frequency_per_day: i32,
    pub valid_until: NaiveDate,
}

fn default_recurring() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsentResponse {
    pub connection: ConnectionResponse,
    pub consent_id: String,
    pub consent_status: ConsentStatus,
    /// Bank URL the user must visit to complete SCA, when the bank issued one.
    pub sca_redirect: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub connection_id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub provider: String,
    pub status: ConnectionStatus,
    pub valid_until: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<BankConnection> for ConnectionResponse {
    fn from(c: BankConnection) -> Self {
        let status = c.status();
        Self {
            connection_id: c.connection_id,
            company_id: c.company_id,
            name: c.name,
            provider: c.provider,
            status,
            valid_until: c.valid_until,
            created_utc: c.created_utc,
            updated_utc: c.updated_utc,
        }
    }
}

// ============================================================================
// Accounts / transactions
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesResponse {
    pub account_id: Uuid,
    pub iban: String,
    pub currency: String,
    pub balance: rust_decimal::Decimal,
    pub available_balance: rust_decimal::Decimal,
    pub last_sync_utc: Option<DateTime<Utc>>,
    /// False when the snapshot was served from storage without a fresh pull.
    pub refreshed: bool,
}

impl BalancesResponse {
    pub fn from_account(a: BankAccount, refreshed: bool) -> Self {
        Self {
            account_id: a.account_id,
            iban: a.iban,
            currency: a.currency,
            balance: a.balance,
            available_balance: a.available_balance,
            last_sync_utc: a.last_sync_utc,
            refreshed,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct CategorizeRequest {
    pub category: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInvoiceRequest {
    pub invoice_id: Uuid,
}

// ============================================================================
// Category rules
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub field: RuleField,
    pub category: String,
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update; the rule to touch is named in the body.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub rule_id: Uuid,
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub is_regex: Option<bool>,
    pub field: Option<RuleField>,
    pub category: Option<String>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRulesQuery {
    #[serde(default)]
    pub active_only: bool,
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub accounts_synced: usize,
    pub transactions_inserted: usize,
}
