//! Bank connection lifecycle: pending -> active -> expired/revoked.
//!
//! A connection wraps exactly one provider consent. Creation submits the
//! consent to the bank and stores the pair in `pending`; activation happens
//! on a later status refresh once the user completes SCA at the bank.
//! Terminal states never transition again, so every status write goes
//! through the guarded compare-and-set in the store.

use crate::models::{BankConnection, ConnectionStatus, ConsentStatus};
use crate::services::consent::{ConsentDraft, ConsentService};
use crate::services::metrics::record_connection_transition;
use crate::services::store::BankingStore;
use crate::services::xs2a::{BankGateway, ConsentSubmission, GatewayError};
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of creating a connection: the stored row plus the SCA redirect
/// the user must visit to authorize the consent at their bank.
#[derive(Debug)]
pub struct CreatedConnection {
    pub connection: BankConnection,
    pub sca_redirect: Option<String>,
}

/// Result of a status refresh. `activated` flags the pending -> active
/// edge so the caller can kick off the initial account sync.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub connection: BankConnection,
    pub activated: bool,
}

pub struct ConnectionService {
    store: Arc<dyn BankingStore>,
    gateway: Arc<dyn BankGateway>,
    consents: ConsentService,
}

impl ConnectionService {
    pub fn new(store: Arc<dyn BankingStore>, gateway: Arc<dyn BankGateway>) -> Self {
        let consents = ConsentService::new(store.clone());
        Self {
            store,
            gateway,
            consents,
        }
    }

    /// Submit a consent to the bank and store the resulting connection in
    /// `pending`. Nothing is persisted if the bank rejects the submission.
    #[instrument(skip(self, draft), fields(company_id = %draft.company_id))]
    pub async fn create(
        &self,
        name: &str,
        provider: &str,
        draft: ConsentDraft,
    ) -> Result<CreatedConnection, AppError> {
        let now = Utc::now();
        ConsentService::validate(&draft, now.date_naive())?;

        let cfg = self
            .store
            .get_provider_config(draft.company_id)
            .await?
            .ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "No provider config for company {}",
                    draft.company_id
                ))
            })?;

        let submission = ConsentSubmission {
            access: draft.access.clone(),
            recurring_indicator: draft.recurring_indicator,
            valid_until: draft.valid_until,
            frequency_per_day: draft.frequency_per_day,
        };
        let provider_consent = self
            .gateway
            .create_consent(&cfg, &submission)
            .await
            .map_err(upstream)?;

        self.consents
            .record(&provider_consent.consent_id, &draft, provider_consent.status)
            .await?;

        let connection = BankConnection {
            connection_id: Uuid::new_v4(),
            company_id: draft.company_id,
            name: name.to_string(),
            provider: provider.to_string(),
            consent_id: provider_consent.consent_id.clone(),
            status: ConnectionStatus::Pending.as_str().to_string(),
            valid_until: draft.valid_until,
            created_utc: now,
            updated_utc: now,
        };
        self.store.create_connection(&connection).await?;

        info!(
            connection_id = %connection.connection_id,
            consent_id = %connection.consent_id,
            "Bank connection created, awaiting SCA"
        );
        Ok(CreatedConnection {
            connection,
            sca_redirect: provider_consent.sca_redirect,
        })
    }

    pub async fn get(&self, connection_id: Uuid) -> Result<BankConnection, AppError> {
        self.store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Connection not found")))
    }

    pub async fn list(&self, company_id: Uuid) -> Result<Vec<BankConnection>, AppError> {
        self.store.list_connections(company_id).await
    }

    /// Re-read the consent status from the bank and apply the resulting
    /// transition. Safe to call repeatedly: a connection already in the
    /// target state is returned unchanged.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn refresh_status(&self, connection_id: Uuid) -> Result<RefreshOutcome, AppError> {
        let connection = self.get(connection_id).await?;
        if connection.status().is_terminal() {
            return Ok(RefreshOutcome {
                connection,
                activated: false,
            });
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

        let remote_status = match self
            .gateway
            .consent_status(&cfg, &connection.consent_id)
            .await
        {
            Ok(status) => status,
            // The bank no longer recognizes the consent at all.
            Err(GatewayError::Unauthorized(detail)) => {
                warn!(connection_id = %connection_id, detail = %detail,
                    "Provider rejected consent lookup; expiring connection");
                ConsentStatus::Expired
            }
            Err(other) => return Err(upstream(other)),
        };

        match remote_status {
            ConsentStatus::Received => Err(AppError::ConsentNotYetAuthorized(
                "User has not completed SCA for this consent".into(),
            )),
            ConsentStatus::Valid => {
                self.store
                    .update_consent_status(&connection.consent_id, ConsentStatus::Valid)
                    .await?;
                let activated = self
                    .transition(&connection, ConnectionStatus::Active)
                    .await?;
                if activated {
                    let accounts = self
                        .gateway
                        .list_accounts(&cfg, &connection.consent_id)
                        .await
                        .map_err(upstream)?;
                    self.store
                        .upsert_accounts(connection.connection_id, &accounts)
                        .await?;
                    info!(
                        connection_id = %connection_id,
                        accounts = accounts.len(),
                        "Connection activated"
                    );
                }
                Ok(RefreshOutcome {
                    connection: self.get(connection_id).await?,
                    activated,
                })
            }
            ConsentStatus::Rejected | ConsentStatus::Revoked => {
                self.store
                    .update_consent_status(&connection.consent_id, remote_status)
                    .await?;
                if self
                    .transition(&connection, ConnectionStatus::Revoked)
                    .await?
                {
                    self.store
                        .deactivate_accounts(connection.connection_id)
                        .await?;
                }
                Ok(RefreshOutcome {
                    connection: self.get(connection_id).await?,
                    activated: false,
                })
            }
            ConsentStatus::Expired => {
                self.store
                    .update_consent_status(&connection.consent_id, ConsentStatus::Expired)
                    .await?;
                self.transition(&connection, ConnectionStatus::Expired)
                    .await?;
                Ok(RefreshOutcome {
                    connection: self.get(connection_id).await?,
                    activated: false,
                })
            }
        }
    }

    /// User-initiated revocation. Idempotent: revoking an already-revoked
    /// connection is a no-op; revoking an expired one is a conflict.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn revoke(&self, connection_id: Uuid) -> Result<BankConnection, AppError> {
        let connection = self.get(connection_id).await?;
        match connection.status() {
            ConnectionStatus::Revoked => return Ok(connection),
            ConnectionStatus::Expired => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Connection already expired"
                )))
            }
            ConnectionStatus::Pending | ConnectionStatus::Active => {}
        }

        if self
            .transition(&connection, ConnectionStatus::Revoked)
            .await?
        {
            self.store
                .update_consent_status(&connection.consent_id, ConsentStatus::Revoked)
                .await?;
            self.store
                .deactivate_accounts(connection.connection_id)
                .await?;
            info!(connection_id = %connection_id, "Connection revoked");
        }
        self.get(connection_id).await
    }

    /// Background sweep: move every connection whose consent validity date
    /// has passed into `expired`. Returns how many transitioned.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self) -> Result<usize, AppError> {
        let today = Utc::now().date_naive();
        let overdue = self.store.list_overdue_connections(today).await?;
        let mut expired = 0;
        for connection in overdue {
            if self
                .transition(&connection, ConnectionStatus::Expired)
                .await?
            {
                self.store
                    .update_consent_status(&connection.consent_id, ConsentStatus::Expired)
                    .await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "Expired overdue connections");
        }
        Ok(expired)
    }

    /// Guarded transition from the connection's current status. Returns
    /// false when the row moved underneath us or the edge is not allowed.
    async fn transition(
        &self,
        connection: &BankConnection,
        to: ConnectionStatus,
    ) -> Result<bool, AppError> {
        let from = connection.status();
        if from == to {
            return Ok(false);
        }
        if !from.can_transition(to) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Connection cannot move from {} to {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let changed = self
            .store
            .set_connection_status(connection.connection_id, from, to)
            .await?;
        if changed {
            record_connection_transition(from.as_str(), to.as_str());
        }
        Ok(changed)
    }
}

fn upstream(err: GatewayError) -> AppError {
    match err {
        GatewayError::Transient(d) | GatewayError::Permanent(d) | GatewayError::Unauthorized(d) => {
            AppError::UpstreamError(d)
        }
    }
}
