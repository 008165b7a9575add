//! Account sync engine: scope- and quota-gated pulls from the bank API.
//!
//! One sync task may run per connection at a time (single-flight mutex);
//! distinct connections sync concurrently. The commit unit is one account's
//! balances plus its newly fetched transactions; a failed batch leaves
//! `last_sync_utc` untouched so the retry re-fetches the same window and the
//! dedup key absorbs the rows that did make it in.

use crate::models::{BankConnection, ConnectionStatus, ConsentStatus, NewBankTransaction};
use crate::services::categorize::{self, CompiledRule, MatchFields};
use crate::services::metrics::{record_connection_transition, record_sync_run};
use crate::services::store::BankingStore;
use crate::services::xs2a::{BankGateway, GatewayError, RemoteTransaction};
use backoff::ExponentialBackoff;
use chrono::{NaiveDate, Timelike, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How far back the first sync of an account reaches.
const INITIAL_LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub accounts_synced: usize,
    pub transactions_inserted: usize,
}

pub struct SyncEngine {
    store: Arc<dyn BankingStore>,
    gateway: Arc<dyn BankGateway>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    retry_max_elapsed: Duration,
}

/// De-duplication key for a remote transaction: the bank's stable id when it
/// provides one, otherwise a SHA-256 over the composite identity fields.
pub fn dedup_key(account_id: Uuid, t: &RemoteTransaction) -> String {
    if let Some(external_id) = &t.external_id {
        return external_id.clone();
    }
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(t.amount.to_string().as_bytes());
    hasher.update(t.booking_date.to_string().as_bytes());
    hasher.update(t.description.as_bytes());
    hex::encode(hasher.finalize())
}

/// The window a sync call fetches: explicit caller window, else
/// `[last_sync, today]`, else an initial lookback.
pub fn sync_window(
    last_sync: Option<NaiveDate>,
    today: NaiveDate,
    explicit: Option<(NaiveDate, NaiveDate)>,
) -> (NaiveDate, NaiveDate) {
    if let Some(window) = explicit {
        return window;
    }
    let from = last_sync.unwrap_or_else(|| today - chrono::Duration::days(INITIAL_LOOKBACK_DAYS));
    (from, today)
}

fn seconds_until_utc_midnight(now: chrono::DateTime<Utc>) -> u64 {
    u64::from(86_400u32.saturating_sub(now.time().num_seconds_from_midnight()))
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn BankingStore>,
        gateway: Arc<dyn BankGateway>,
        retry_max_elapsed: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            locks: DashMap::new(),
            retry_max_elapsed,
        }
    }

    /// Sync all accounts under an active connection.
    ///
    /// `window` overrides the per-account `[last_sync, now]` default.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn sync_connection(
        &self,
        connection_id: Uuid,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<SyncOutcome, AppError> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Connection not found")))?;

        match connection.status() {
            ConnectionStatus::Active => {}
            ConnectionStatus::Pending => {
                return Err(AppError::ConsentNotYetAuthorized(
                    "Connection is awaiting SCA completion".into(),
                ))
            }
            ConnectionStatus::Expired => {
                return Err(AppError::ConsentExpired("Connection has expired".into()))
            }
            ConnectionStatus::Revoked => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Connection has been revoked"
                )))
            }
        }

        // Serialize syncs per connection; other connections proceed in parallel.
        let lock = self.locks.entry(connection_id).or_default().clone();
        let _guard = lock.lock().await;

        let now = Utc::now();
        let consent = self
            .store
            .get_consent(&connection.consent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Consent not found")))?;

        // Never called against an invalid consent; the provider penalizes that.
        if !consent.is_valid_at(now) {
            self.expire(&connection).await?;
            record_sync_run("expired");
            return Err(AppError::ConsentExpired(
                "Consent validity window has passed".into(),
            ));
        }

        let cfg = self
            .store
            .get_provider_config(connection.company_id)
            .await?
            .ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "No provider config for company {}",
                    connection.company_id
                ))
            })?;

        let calls_today = self
            .store
            .count_sync_calls(connection_id, now.date_naive())
            .await?;
        if calls_today >= i64::from(consent.frequency_per_day) {
            record_sync_run("rate_limited");
            return Err(AppError::RateLimited(
                format!(
                    "Daily access quota of {} reached for this consent",
                    consent.frequency_per_day
                ),
                Some(seconds_until_utc_midnight(now)),
            ));
        }
        self.store.record_sync_call(connection_id, now).await?;

        let rules = categorize::compile_rules(
            self.store.list_rules(connection.company_id, true).await?,
        );

        let accounts = self.store.list_accounts(connection_id).await?;
        let mut outcome = SyncOutcome::default();

        for account in &accounts {
            let (date_from, date_to) = sync_window(
                account.last_sync_utc.map(|t| t.date_naive()),
                now.date_naive(),
                window,
            );

            let balances = if consent.access.grants_balances() {
                match self
                    .with_retry(|| {
                        self.gateway
                            .balances(&cfg, &consent.consent_id, &account.resource_id)
                    })
                    .await
                {
                    Ok(b) => Some(b),
                    Err(e) => return self.handle_gateway_failure(&connection, e).await,
                }
            } else {
                None
            };

            let remote = if consent.access.grants_transactions() {
                match self
                    .with_retry(|| {
                        self.gateway.transactions(
                            &cfg,
                            &consent.consent_id,
                            &account.resource_id,
                            date_from,
                            date_to,
                        )
                    })
                    .await
                {
                    Ok(t) => t,
                    Err(e) => return self.handle_gateway_failure(&connection, e).await,
                }
            } else {
                Vec::new()
            };

            let new_transactions = self
                .prepare_batch(account.account_id, remote, &rules)
                .await?;

            let (balance, available) = match balances {
                Some(b) => (b.balance, b.available_balance),
                None => (account.balance, account.available_balance),
            };

            let inserted = self
                .store
                .commit_sync_batch(account.account_id, balance, available, &new_transactions, now)
                .await
                .map_err(|e| {
                    record_sync_run("failed");
                    e
                })?;

            outcome.accounts_synced += 1;
            outcome.transactions_inserted += inserted;
        }

        record_sync_run("ok");
        info!(
            connection_id = %connection_id,
            accounts = outcome.accounts_synced,
            inserted = outcome.transactions_inserted,
            "Connection synced"
        );
        Ok(outcome)
    }

    /// Filter out already-stored transactions and categorize the remainder
    /// before anything is committed, so no caller ever observes an
    /// uncategorized-but-rule-matchable row.
    async fn prepare_batch(
        &self,
        account_id: Uuid,
        remote: Vec<RemoteTransaction>,
        rules: &[CompiledRule],
    ) -> Result<Vec<NewBankTransaction>, AppError> {
        let keys: Vec<String> = remote.iter().map(|t| dedup_key(account_id, t)).collect();
        let existing = self.store.existing_dedup_keys(account_id, &keys).await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();
        for (t, key) in remote.into_iter().zip(keys) {
            if existing.contains(&key) || !seen.insert(key.clone()) {
                continue;
            }
            let category = categorize::categorize(
                &MatchFields {
                    description: &t.description,
                    reference: t.reference.as_deref(),
                    counterparty: t.counterparty_name.as_deref(),
                },
                rules,
            );
            batch.push(NewBankTransaction {
                external_id: t.external_id,
                dedup_key: key,
                amount: t.amount,
                currency: t.currency,
                booking_date: t.booking_date,
                value_date: t.value_date,
                description: t.description,
                reference: t.reference,
                counterparty_name: t.counterparty_name,
                counterparty_iban: t.counterparty_iban,
                category,
                status: "booked".to_string(),
            });
        }
        Ok(batch)
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        };
        backoff::future::retry(policy, || async {
            op().await.map_err(|e| match e {
                GatewayError::Transient(_) => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .await
    }

    /// A 401 means the consent died provider-side: transition immediately,
    /// do not retry. Everything else surfaces as a transient sync failure.
    async fn handle_gateway_failure(
        &self,
        connection: &BankConnection,
        err: GatewayError,
    ) -> Result<SyncOutcome, AppError> {
        match err {
            GatewayError::Unauthorized(detail) => {
                warn!(connection_id = %connection.connection_id, detail = %detail,
                    "Provider no longer accepts the consent; expiring connection");
                self.expire(connection).await?;
                record_sync_run("expired");
                Err(AppError::ConsentExpired(detail))
            }
            other => {
                record_sync_run("failed");
                Err(AppError::SyncFailed(other.to_string()))
            }
        }
    }

    async fn expire(&self, connection: &BankConnection) -> Result<(), AppError> {
        let transitioned = self
            .store
            .set_connection_status(
                connection.connection_id,
                connection.status(),
                ConnectionStatus::Expired,
            )
            .await?;
        if transitioned {
            record_connection_transition(connection.status().as_str(), "expired");
            self.store
                .update_consent_status(&connection.consent_id, ConsentStatus::Expired)
                .await?;
        }
        Ok(())
    }
}
