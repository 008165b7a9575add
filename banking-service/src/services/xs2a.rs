//! Berlin-Group NextGenPSD2 (XS2A) gateway client.
//!
//! Implements the AIS consent and account-information endpoints used by the
//! sync engine: consent creation/status, account discovery, balances and
//! booked transactions. Provider credentials are per-company; the underlying
//! reqwest client is cached per company because the optional mTLS identity is
//! part of the client, not the request.

use crate::models::{ConsentAccess, ConsentStatus, NewBankAccount, ProviderConfig};
use crate::services::metrics::PROVIDER_REQUESTS;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Gateway failures, pre-classified for the sync engine's retry policy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 401/403: the consent is no longer accepted by the bank.
    #[error("Provider rejected the consent or credentials: {0}")]
    Unauthorized(String),
    /// Timeouts and 5xx: worth retrying with backoff.
    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),
    /// Anything else: retrying will not help.
    #[error("Provider error: {0}")]
    Permanent(String),
}

/// Consent request as submitted to the bank.
#[derive(Debug, Clone)]
pub struct ConsentSubmission {
    pub access: ConsentAccess,
    pub recurring_indicator: bool,
    pub valid_until: NaiveDate,
    pub frequency_per_day: i32,
}

/// Bank's answer to a consent creation.
#[derive(Debug, Clone)]
pub struct ProviderConsent {
    pub consent_id: String,
    pub status: ConsentStatus,
    /// Where to send the user for strong customer authentication.
    pub sca_redirect: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccountBalances {
    pub balance: Decimal,
    pub available_balance: Decimal,
}

/// A booked transaction as reported by the bank.
#[derive(Debug, Clone)]
pub struct RemoteTransaction {
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub booking_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: String,
    pub reference: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
}

/// Seam between the sync/connection services and the bank API.
#[async_trait]
pub trait BankGateway: Send + Sync {
    async fn create_consent(
        &self,
        cfg: &ProviderConfig,
        submission: &ConsentSubmission,
    ) -> Result<ProviderConsent, GatewayError>;

    async fn consent_status(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
    ) -> Result<ConsentStatus, GatewayError>;

    async fn list_accounts(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
    ) -> Result<Vec<NewBankAccount>, GatewayError>;

    async fn balances(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
        resource_id: &str,
    ) -> Result<AccountBalances, GatewayError>;

    async fn transactions(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
        resource_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<RemoteTransaction>, GatewayError>;
}

// ============================================================================
// Wire types (XS2A JSON)
// ============================================================================

#[derive(Serialize)]
struct AccountReference {
    iban: String,
}

#[derive(Serialize)]
struct AccessBody {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    accounts: Vec<AccountReference>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    balances: Vec<AccountReference>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transactions: Vec<AccountReference>,
    #[serde(rename = "allPsd2", skip_serializing_if = "Option::is_none")]
    all_psd2: Option<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConsentBody {
    access: AccessBody,
    recurring_indicator: bool,
    valid_until: NaiveDate,
    frequency_per_day: i32,
    combined_service_indicator: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentCreatedResponse {
    consent_id: String,
    consent_status: String,
    #[serde(rename = "_links", default)]
    links: Option<ConsentLinks>,
}

#[derive(Deserialize, Default)]
struct ConsentLinks {
    #[serde(rename = "scaRedirect")]
    sca_redirect: Option<Href>,
}

#[derive(Deserialize)]
struct Href {
    href: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentStatusResponse {
    consent_status: String,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountEntry {
    resource_id: String,
    iban: String,
    currency: String,
}

#[derive(Deserialize)]
struct BalancesResponse {
    balances: Vec<BalanceEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceEntry {
    balance_amount: AmountEntry,
    balance_type: String,
}

#[derive(Deserialize)]
struct AmountEntry {
    currency: String,
    amount: String,
}

#[derive(Deserialize)]
struct TransactionsResponse {
    transactions: BookedTransactions,
}

#[derive(Deserialize, Default)]
struct BookedTransactions {
    #[serde(default)]
    booked: Vec<TransactionEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEntry {
    transaction_id: Option<String>,
    end_to_end_id: Option<String>,
    booking_date: NaiveDate,
    value_date: Option<NaiveDate>,
    transaction_amount: AmountEntry,
    creditor_name: Option<String>,
    creditor_account: Option<IbanEntry>,
    debtor_name: Option<String>,
    debtor_account: Option<IbanEntry>,
    remittance_information_unstructured: Option<String>,
}

#[derive(Deserialize)]
struct IbanEntry {
    iban: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// XS2A HTTP client with a per-company client cache (mTLS identity).
pub struct Xs2aClient {
    clients: DashMap<Uuid, reqwest::Client>,
    timeout: Duration,
}

impl Xs2aClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout: request_timeout,
        }
    }

    fn client_for(&self, cfg: &ProviderConfig) -> Result<reqwest::Client, GatewayError> {
        if let Some(client) = self.clients.get(&cfg.company_id) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);

        if let (Some(cert_path), Some(key_path)) = (&cfg.cert_path, &cfg.key_path) {
            let mut pem = std::fs::read(cert_path).map_err(|e| {
                GatewayError::Permanent(format!("Cannot read client certificate: {}", e))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                GatewayError::Permanent(format!("Cannot read client key: {}", e))
            })?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| GatewayError::Permanent(format!("Invalid mTLS identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Permanent(format!("Cannot build HTTP client: {}", e)))?;
        self.clients.insert(cfg.company_id, client.clone());
        Ok(client)
    }

    fn classify(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() || err.is_connect() {
            GatewayError::Transient(err.to_string())
        } else {
            GatewayError::Permanent(err.to_string())
        }
    }

    async fn check_status(
        endpoint: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        PROVIDER_REQUESTS
            .with_label_values(&[endpoint, status.as_str()])
            .inc();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(GatewayError::Unauthorized(format!("{}: {}", status, body)))
        } else if status.is_server_error() {
            Err(GatewayError::Transient(format!("{}: {}", status, body)))
        } else {
            Err(GatewayError::Permanent(format!("{}: {}", status, body)))
        }
    }

    fn parse_amount(raw: &AmountEntry) -> Result<Decimal, GatewayError> {
        raw.amount
            .parse::<Decimal>()
            .map_err(|e| GatewayError::Permanent(format!("Malformed amount '{}': {}", raw.amount, e)))
    }
}

fn access_body(access: &ConsentAccess) -> AccessBody {
    let refs = |ibans: &[String]| {
        ibans
            .iter()
            .map(|iban| AccountReference { iban: iban.clone() })
            .collect()
    };
    AccessBody {
        accounts: refs(&access.accounts),
        balances: refs(&access.balances),
        transactions: refs(&access.transactions),
        all_psd2: access.all_psd2.map(|scope| match scope {
            crate::models::AllAccountsScope::AllAccounts => "allAccounts",
            crate::models::AllAccountsScope::AllAccountsWithOwnerName => {
                "allAccountsWithOwnerName"
            }
        }),
    }
}

#[async_trait]
impl BankGateway for Xs2aClient {
    async fn create_consent(
        &self,
        cfg: &ProviderConfig,
        submission: &ConsentSubmission,
    ) -> Result<ProviderConsent, GatewayError> {
        let body = CreateConsentBody {
            access: access_body(&submission.access),
            recurring_indicator: submission.recurring_indicator,
            valid_until: submission.valid_until,
            frequency_per_day: submission.frequency_per_day,
            combined_service_indicator: false,
        };

        let response = self
            .client_for(cfg)?
            .post(format!("{}/v1/consents", cfg.api_url))
            .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("TPP-Redirect-URI", &cfg.redirect_uri)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;

        let parsed: ConsentCreatedResponse = Self::check_status("create_consent", response)
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        Ok(ProviderConsent {
            consent_id: parsed.consent_id,
            status: ConsentStatus::from_str(&parsed.consent_status),
            sca_redirect: parsed
                .links
                .and_then(|l| l.sca_redirect)
                .map(|h| h.href),
        })
    }

    async fn consent_status(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
    ) -> Result<ConsentStatus, GatewayError> {
        let response = self
            .client_for(cfg)?
            .get(format!("{}/v1/consents/{}/status", cfg.api_url, consent_id))
            .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(Self::classify)?;

        let parsed: ConsentStatusResponse = Self::check_status("consent_status", response)
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        Ok(ConsentStatus::from_str(&parsed.consent_status))
    }

    async fn list_accounts(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
    ) -> Result<Vec<NewBankAccount>, GatewayError> {
        let response = self
            .client_for(cfg)?
            .get(format!("{}/v1/accounts", cfg.api_url))
            .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("Consent-ID", consent_id)
            .send()
            .await
            .map_err(Self::classify)?;

        let parsed: AccountsResponse = Self::check_status("list_accounts", response)
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        Ok(parsed
            .accounts
            .into_iter()
            .map(|a| NewBankAccount {
                resource_id: a.resource_id,
                iban: a.iban,
                currency: a.currency,
            })
            .collect())
    }

    async fn balances(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
        resource_id: &str,
    ) -> Result<AccountBalances, GatewayError> {
        let response = self
            .client_for(cfg)?
            .get(format!(
                "{}/v1/accounts/{}/balances",
                cfg.api_url, resource_id
            ))
            .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("Consent-ID", consent_id)
            .send()
            .await
            .map_err(Self::classify)?;

        let parsed: BalancesResponse = Self::check_status("balances", response)
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        let mut booked = None;
        let mut available = None;
        for entry in &parsed.balances {
            let amount = Self::parse_amount(&entry.balance_amount)?;
            match entry.balance_type.as_str() {
                "closingBooked" | "expected" => booked = Some(amount),
                "interimAvailable" | "available" => available = Some(amount),
                _ => {}
            }
        }

        let balance = booked
            .or(available)
            .ok_or_else(|| GatewayError::Permanent("No usable balance in response".into()))?;
        Ok(AccountBalances {
            balance,
            available_balance: available.unwrap_or(balance),
        })
    }

    async fn transactions(
        &self,
        cfg: &ProviderConfig,
        consent_id: &str,
        resource_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<RemoteTransaction>, GatewayError> {
        let response = self
            .client_for(cfg)?
            .get(format!(
                "{}/v1/accounts/{}/transactions",
                cfg.api_url, resource_id
            ))
            .query(&[
                ("dateFrom", date_from.to_string()),
                ("dateTo", date_to.to_string()),
                ("bookingStatus", "booked".to_string()),
            ])
            .basic_auth(&cfg.client_id, Some(&cfg.client_secret))
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("Consent-ID", consent_id)
            .send()
            .await
            .map_err(Self::classify)?;

        let parsed: TransactionsResponse = Self::check_status("transactions", response)
            .await?
            .json()
            .await
            .map_err(Self::classify)?;

        let mut out = Vec::with_capacity(parsed.transactions.booked.len());
        for entry in parsed.transactions.booked {
            let amount = Self::parse_amount(&entry.transaction_amount)?;
            // Debits flow to a creditor, credits come from a debtor.
            let (counterparty_name, counterparty_iban) = if amount < Decimal::ZERO {
                (
                    entry.creditor_name,
                    entry.creditor_account.and_then(|a| a.iban),
                )
            } else {
                (
                    entry.debtor_name,
                    entry.debtor_account.and_then(|a| a.iban),
                )
            };

            out.push(RemoteTransaction {
                external_id: entry.transaction_id,
                amount,
                currency: entry.transaction_amount.currency,
                booking_date: entry.booking_date,
                value_date: entry.value_date,
                description: entry
                    .remittance_information_unstructured
                    .unwrap_or_default(),
                reference: entry.end_to_end_id,
                counterparty_name,
                counterparty_iban,
            });
        }
        Ok(out)
    }
}
