//! Consent store: validation and durable record of PSD2 consent requests.

use crate::models::{ConsentAccess, ConsentRecord, ConsentStatus};
use crate::services::store::BankingStore;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub const MIN_FREQUENCY_PER_DAY: i32 = 1;
pub const MAX_FREQUENCY_PER_DAY: i32 = 100;

/// Validated consent parameters, ready for submission to the bank.
#[derive(Debug, Clone)]
pub struct ConsentDraft {
    pub company_id: Uuid,
    pub access: ConsentAccess,
    pub recurring_indicator: bool,
    pub frequency_per_day: i32,
    pub valid_until: NaiveDate,
}

pub struct ConsentService {
    store: Arc<dyn BankingStore>,
}

impl ConsentService {
    pub fn new(store: Arc<dyn BankingStore>) -> Self {
        Self { store }
    }

    /// Validate a consent draft before anything is sent to the bank.
    pub fn validate(draft: &ConsentDraft, today: NaiveDate) -> Result<(), AppError> {
        if draft.access.is_empty() {
            return Err(AppError::InvalidScope(
                "Consent access declares no accounts, balances or transactions".into(),
            ));
        }
        if draft.valid_until <= today {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "validUntil must be in the future"
            )));
        }
        if !(MIN_FREQUENCY_PER_DAY..=MAX_FREQUENCY_PER_DAY).contains(&draft.frequency_per_day) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "frequencyPerDay must be between {} and {}",
                MIN_FREQUENCY_PER_DAY,
                MAX_FREQUENCY_PER_DAY
            )));
        }
        Ok(())
    }

    /// Persist the bank-acknowledged consent. This is the only mutation the
    /// consent store performs; the bank round-trip lives in the connection flow.
    #[instrument(skip(self, draft), fields(consent_id = %consent_id))]
    pub async fn record(
        &self,
        consent_id: &str,
        draft: &ConsentDraft,
        status: ConsentStatus,
    ) -> Result<ConsentRecord, AppError> {
        let record = ConsentRecord {
            consent_id: consent_id.to_string(),
            company_id: draft.company_id,
            access: draft.access.clone(),
            recurring_indicator: draft.recurring_indicator,
            frequency_per_day: draft.frequency_per_day,
            valid_until: draft.valid_until,
            status,
            created_utc: Utc::now(),
        };
        self.store.create_consent(&record).await?;
        Ok(record)
    }

    pub async fn get(&self, consent_id: &str) -> Result<ConsentRecord, AppError> {
        self.store
            .get_consent(consent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Consent not found")))
    }

    /// True iff the consent exists, is not revoked/rejected, and `at` falls
    /// within its validity window.
    pub async fn is_valid(&self, consent_id: &str, at: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(self.get(consent_id).await?.is_valid_at(at))
    }
}
