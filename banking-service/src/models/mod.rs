//! Domain models for banking-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Consent Models
// ============================================================================

/// PSD2 consent access scope, as declared to the bank.
///
/// Either one or more of the IBAN-scoped subsets is populated, or
/// `all_psd2` covers every account the PSU holds at the ASPSP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentAccess {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub balances: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_psd2: Option<AllAccountsScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllAccountsScope {
    #[serde(rename = "allAccounts")]
    AllAccounts,
    #[serde(rename = "allAccountsWithOwnerName")]
    AllAccountsWithOwnerName,
}

impl ConsentAccess {
    /// A scope that declares nothing is invalid per the XS2A consent model.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.balances.is_empty()
            && self.transactions.is_empty()
            && self.all_psd2.is_none()
    }

    pub fn grants_balances(&self) -> bool {
        self.all_psd2.is_some() || !self.balances.is_empty()
    }

    pub fn grants_transactions(&self) -> bool {
        self.all_psd2.is_some() || !self.transactions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Received,
    Valid,
    Rejected,
    Revoked,
    Expired,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Valid => "valid",
            Self::Rejected => "rejected",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "valid" => Self::Valid,
            "rejected" => Self::Rejected,
            "revoked" => Self::Revoked,
            "expired" => Self::Expired,
            _ => Self::Received,
        }
    }

    /// Statuses under which the bank will still serve data for the consent.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Received | Self::Valid)
    }
}

/// A consent request as submitted to the bank, immutable apart from status.
#[derive(Debug, Clone)]
pub struct ConsentRecord {
    /// Bank-issued consent identifier.
    pub consent_id: String,
    pub company_id: Uuid,
    pub access: ConsentAccess,
    pub recurring_indicator: bool,
    pub frequency_per_day: i32,
    pub valid_until: NaiveDate,
    pub status: ConsentStatus,
    pub created_utc: DateTime<Utc>,
}

impl ConsentRecord {
    /// True iff the consent can still be exercised at `at`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.status.is_usable() && at.date_naive() <= self.valid_until
    }
}

// ============================================================================
// Connection Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "expired" => Self::Expired,
            "revoked" => Self::Revoked,
            _ => Self::Pending,
        }
    }

    /// Legal lifecycle moves. `Expired` and `Revoked` are terminal.
    pub fn can_transition(&self, to: ConnectionStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, ConnectionStatus::Active)
                | (Self::Pending, ConnectionStatus::Revoked)
                | (Self::Pending, ConnectionStatus::Expired)
                | (Self::Active, ConnectionStatus::Expired)
                | (Self::Active, ConnectionStatus::Revoked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

/// One bank relationship for one company, governed by exactly one consent.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BankConnection {
    pub connection_id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub provider: String,
    pub consent_id: String,
    pub status: String,
    pub valid_until: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl BankConnection {
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_str(&self.status)
    }
}

// ============================================================================
// Account Models
// ============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub account_id: Uuid,
    pub connection_id: Uuid,
    /// Provider-side account resource identifier.
    pub resource_id: String,
    pub iban: String,
    pub currency: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
    pub last_sync_utc: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

/// Account as discovered at the provider during connection activation.
#[derive(Debug, Clone)]
pub struct NewBankAccount {
    pub resource_id: String,
    pub iban: String,
    pub currency: String,
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    /// Stable bank-side identifier, when the ASPSP provides one.
    pub external_id: Option<String>,
    /// De-duplication key: `external_id` or a composite hash (see sync engine).
    pub dedup_key: String,
    /// Signed; negative = debit.
    pub amount: Decimal,
    pub currency: String,
    pub booking_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: String,
    pub reference: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub category: Option<String>,
    pub is_manual_category: bool,
    pub invoice_id: Option<Uuid>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

/// A transaction fetched from the bank, categorized and ready to commit.
#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub external_id: Option<String>,
    pub dedup_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub booking_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: String,
    pub reference: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub category: Option<String>,
    pub status: String,
}

// ============================================================================
// Category Rule Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleField {
    Description,
    Reference,
    Counterparty,
}

impl RuleField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::Reference => "reference",
            Self::Counterparty => "counterparty",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "reference" => Self::Reference,
            "counterparty" => Self::Counterparty,
            _ => Self::Description,
        }
    }
}

/// Company-scoped categorization rule. Lower priority evaluates first;
/// ties break by `rule_id` ascending.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRule {
    pub rule_id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub pattern: String,
    pub is_regex: bool,
    pub field: String,
    pub category: String,
    pub priority: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl CategoryRule {
    pub fn field(&self) -> RuleField {
        RuleField::from_str(&self.field)
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// PSD2 provider (ASPSP gateway) credentials for one company.
#[derive(Debug, Clone, FromRow)]
pub struct ProviderConfig {
    pub company_id: Uuid,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub updated_utc: DateTime<Utc>,
}
