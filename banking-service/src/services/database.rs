//! Postgres store for banking-service.

use crate::models::{
    BankAccount, BankConnection, BankTransaction, CategoryRule, ConnectionStatus, ConsentAccess,
    ConsentRecord, ConsentStatus, NewBankAccount, NewBankTransaction, ProviderConfig,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BankingStore, RuleUpdate};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Raw consent row; the access scope is stored as JSON text.
#[derive(sqlx::FromRow)]
struct ConsentRow {
    consent_id: String,
    company_id: Uuid,
    access_json: String,
    recurring_indicator: bool,
    frequency_per_day: i32,
    valid_until: NaiveDate,
    status: String,
    created_utc: DateTime<Utc>,
}

impl ConsentRow {
    fn into_record(self) -> Result<ConsentRecord, AppError> {
        let access: ConsentAccess = serde_json::from_str(&self.access_json)
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Corrupt consent scope: {}", e)))?;
        Ok(ConsentRecord {
            consent_id: self.consent_id,
            company_id: self.company_id,
            access,
            recurring_indicator: self.recurring_indicator,
            frequency_per_day: self.frequency_per_day,
            valid_until: self.valid_until,
            status: ConsentStatus::from_str(&self.status),
            created_utc: self.created_utc,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "banking-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn day_bounds(day: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    let end = day
        .succ_opt()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Date out of range")))?
        .and_time(NaiveTime::MIN)
        .and_utc();
    Ok((start, end))
}

#[async_trait]
impl BankingStore for Database {
    async fn health_check(&self) -> Result<(), AppError> {
        Database::health_check(self).await
    }

    // =========================================================================
    // Provider Configuration
    // =========================================================================

    #[instrument(skip(self, cfg), fields(company_id = %cfg.company_id))]
    async fn upsert_provider_config(&self, cfg: &ProviderConfig) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_provider_config"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO provider_configs (company_id, api_url, client_id, client_secret, redirect_uri, cert_path, key_path, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (company_id) DO UPDATE
            SET api_url = EXCLUDED.api_url,
                client_id = EXCLUDED.client_id,
                client_secret = EXCLUDED.client_secret,
                redirect_uri = EXCLUDED.redirect_uri,
                cert_path = EXCLUDED.cert_path,
                key_path = EXCLUDED.key_path,
                updated_utc = NOW()
            "#,
        )
        .bind(cfg.company_id)
        .bind(&cfg.api_url)
        .bind(&cfg.client_id)
        .bind(&cfg.client_secret)
        .bind(&cfg.redirect_uri)
        .bind(&cfg.cert_path)
        .bind(&cfg.key_path)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to store provider config: {}", e)))?;

        timer.observe_duration();
        info!(company_id = %cfg.company_id, "Provider config stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_provider_config(
        &self,
        company_id: Uuid,
    ) -> Result<Option<ProviderConfig>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_provider_config"])
            .start_timer();

        let cfg = sqlx::query_as::<_, ProviderConfig>(
            r#"
            SELECT company_id, api_url, client_id, client_secret, redirect_uri, cert_path, key_path, updated_utc
            FROM provider_configs
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get provider config: {}", e)))?;

        timer.observe_duration();
        Ok(cfg)
    }

    // =========================================================================
    // Consents
    // =========================================================================

    #[instrument(skip(self, consent), fields(consent_id = %consent.consent_id))]
    async fn create_consent(&self, consent: &ConsentRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_consent"])
            .start_timer();

        let access_json = serde_json::to_string(&consent.access)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Scope serialization: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO consents (consent_id, company_id, access_json, recurring_indicator, frequency_per_day, valid_until, status, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&consent.consent_id)
        .bind(consent.company_id)
        .bind(&access_json)
        .bind(consent.recurring_indicator)
        .bind(consent.frequency_per_day)
        .bind(consent.valid_until)
        .bind(consent.status.as_str())
        .bind(consent.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create consent: {}", e)))?;

        timer.observe_duration();
        info!(consent_id = %consent.consent_id, "Consent stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_consent(&self, consent_id: &str) -> Result<Option<ConsentRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_consent"])
            .start_timer();

        let row = sqlx::query_as::<_, ConsentRow>(
            r#"
            SELECT consent_id, company_id, access_json, recurring_indicator, frequency_per_day, valid_until, status, created_utc
            FROM consents
            WHERE consent_id = $1
            "#,
        )
        .bind(consent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get consent: {}", e)))?;

        timer.observe_duration();
        row.map(ConsentRow::into_record).transpose()
    }

    #[instrument(skip(self))]
    async fn update_consent_status(
        &self,
        consent_id: &str,
        status: ConsentStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_consent_status"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE consents
            SET status = $2
            WHERE consent_id = $1
            "#,
        )
        .bind(consent_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update consent status: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    #[instrument(skip(self, connection), fields(connection_id = %connection.connection_id))]
    async fn create_connection(&self, connection: &BankConnection) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_connection"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO bank_connections (connection_id, company_id, name, provider, consent_id, status, valid_until, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(connection.connection_id)
        .bind(connection.company_id)
        .bind(&connection.name)
        .bind(&connection.provider)
        .bind(&connection.consent_id)
        .bind(&connection.status)
        .bind(connection.valid_until)
        .bind(connection.created_utc)
        .bind(connection.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create connection: {}", e)))?;

        timer.observe_duration();
        info!(connection_id = %connection.connection_id, "Connection created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<BankConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_connection"])
            .start_timer();

        let connection = sqlx::query_as::<_, BankConnection>(
            r#"
            SELECT connection_id, company_id, name, provider, consent_id, status, valid_until, created_utc, updated_utc
            FROM bank_connections
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get connection: {}", e)))?;

        timer.observe_duration();
        Ok(connection)
    }

    #[instrument(skip(self))]
    async fn list_connections(&self, company_id: Uuid) -> Result<Vec<BankConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_connections"])
            .start_timer();

        let connections = sqlx::query_as::<_, BankConnection>(
            r#"
            SELECT connection_id, company_id, name, provider, consent_id, status, valid_until, created_utc, updated_utc
            FROM bank_connections
            WHERE company_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list connections: {}", e)))?;

        timer.observe_duration();
        Ok(connections)
    }

    #[instrument(skip(self))]
    async fn set_connection_status(
        &self,
        connection_id: Uuid,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_connection_status"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE bank_connections
            SET status = $3, updated_utc = NOW()
            WHERE connection_id = $1 AND status = $2
            "#,
        )
        .bind(connection_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update connection status: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_overdue_connections(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<BankConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_overdue_connections"])
            .start_timer();

        let connections = sqlx::query_as::<_, BankConnection>(
            r#"
            SELECT connection_id, company_id, name, provider, consent_id, status, valid_until, created_utc, updated_utc
            FROM bank_connections
            WHERE status IN ('pending', 'active') AND valid_until < $1
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list overdue connections: {}", e))
        })?;

        timer.observe_duration();
        Ok(connections)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    #[instrument(skip(self, accounts), fields(count = accounts.len()))]
    async fn upsert_accounts(
        &self,
        connection_id: Uuid,
        accounts: &[NewBankAccount],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_accounts"])
            .start_timer();

        for account in accounts {
            sqlx::query(
                r#"
                INSERT INTO bank_accounts (account_id, connection_id, resource_id, iban, currency)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (connection_id, resource_id) DO UPDATE
                SET iban = EXCLUDED.iban, currency = EXCLUDED.currency, is_active = TRUE
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(connection_id)
            .bind(&account.resource_id)
            .bind(&account.iban)
            .bind(&account.currency)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to upsert account: {}", e))
            })?;
        }

        timer.observe_duration();
        info!(connection_id = %connection_id, count = accounts.len(), "Accounts upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_account(&self, account_id: Uuid) -> Result<Option<BankAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, BankAccount>(
            r#"
            SELECT account_id, connection_id, resource_id, iban, currency, balance, available_balance, last_sync_utc, is_active, created_utc
            FROM bank_accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get account: {}", e)))?;

        timer.observe_duration();
        Ok(account)
    }

    #[instrument(skip(self))]
    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, BankAccount>(
            r#"
            SELECT account_id, connection_id, resource_id, iban, currency, balance, available_balance, last_sync_utc, is_active, created_utc
            FROM bank_accounts
            WHERE connection_id = $1 AND is_active = TRUE
            ORDER BY iban
            "#,
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list accounts: {}", e)))?;

        timer.observe_duration();
        Ok(accounts)
    }

    #[instrument(skip(self))]
    async fn list_company_accounts(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<BankAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_company_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, BankAccount>(
            r#"
            SELECT a.account_id, a.connection_id, a.resource_id, a.iban, a.currency, a.balance, a.available_balance, a.last_sync_utc, a.is_active, a.created_utc
            FROM bank_accounts a
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE c.company_id = $1 AND c.status = 'active' AND a.is_active = TRUE
            ORDER BY a.iban
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list company accounts: {}", e))
        })?;

        timer.observe_duration();
        Ok(accounts)
    }

    #[instrument(skip(self))]
    async fn deactivate_accounts(&self, connection_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_accounts"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_accounts
            SET is_active = FALSE
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate accounts: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    #[instrument(skip(self))]
    async fn count_sync_calls(
        &self,
        connection_id: Uuid,
        day: NaiveDate,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_sync_calls"])
            .start_timer();

        let (start, end) = day_bounds(day)?;
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM sync_calls
            WHERE connection_id = $1 AND called_utc >= $2 AND called_utc < $3
            "#,
        )
        .bind(connection_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count sync calls: {}", e)))?;

        timer.observe_duration();
        Ok(count.0)
    }

    #[instrument(skip(self))]
    async fn record_sync_call(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_sync_call"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO sync_calls (call_id, connection_id, called_utc)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(connection_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record sync call: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn existing_dedup_keys(
        &self,
        account_id: Uuid,
        keys: &[String],
    ) -> Result<HashSet<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["existing_dedup_keys"])
            .start_timer();

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT dedup_key
            FROM bank_transactions
            WHERE account_id = $1 AND dedup_key = ANY($2)
            "#,
        )
        .bind(account_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to query dedup keys: {}", e))
        })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    #[instrument(skip(self, transactions), fields(account_id = %account_id, count = transactions.len()))]
    async fn commit_sync_batch(
        &self,
        account_id: Uuid,
        balance: Decimal,
        available_balance: Decimal,
        transactions: &[NewBankTransaction],
        synced_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_sync_batch"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin batch: {}", e)))?;

        let mut inserted = 0usize;
        for t in transactions {
            let result = sqlx::query(
                r#"
                INSERT INTO bank_transactions (transaction_id, account_id, external_id, dedup_key, amount, currency, booking_date, value_date, description, reference, counterparty_name, counterparty_iban, category, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (account_id, dedup_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(&t.external_id)
            .bind(&t.dedup_key)
            .bind(t.amount)
            .bind(&t.currency)
            .bind(t.booking_date)
            .bind(t.value_date)
            .bind(&t.description)
            .bind(&t.reference)
            .bind(&t.counterparty_name)
            .bind(&t.counterparty_iban)
            .bind(&t.category)
            .bind(&t.status)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert transaction: {}", e))
            })?;
            inserted += result.rows_affected() as usize;
        }

        sqlx::query(
            r#"
            UPDATE bank_accounts
            SET balance = $2, available_balance = $3, last_sync_utc = $4
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(balance)
        .bind(available_balance)
        .bind(synced_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update balances: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit batch: {}", e)))?;

        timer.observe_duration();
        info!(account_id = %account_id, inserted = inserted, "Sync batch committed");
        Ok(inserted)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT transaction_id, account_id, external_id, dedup_key, amount, currency, booking_date, value_date, description, reference, counterparty_name, counterparty_iban, category, is_manual_category, invoice_id, status, created_utc
            FROM bank_transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e)))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self))]
    async fn list_account_transactions(
        &self,
        account_id: Uuid,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_account_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT transaction_id, account_id, external_id, dedup_key, amount, currency, booking_date, value_date, description, reference, counterparty_name, counterparty_iban, category, is_manual_category, invoice_id, status, created_utc
            FROM bank_transactions
            WHERE account_id = $1
              AND ($2::date IS NULL OR booking_date >= $2)
              AND ($3::date IS NULL OR booking_date <= $3)
            ORDER BY booking_date DESC, created_utc DESC
            "#,
        )
        .bind(account_id)
        .bind(date_from)
        .bind(date_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn recent_company_transactions(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recent_company_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT t.transaction_id, t.account_id, t.external_id, t.dedup_key, t.amount, t.currency, t.booking_date, t.value_date, t.description, t.reference, t.counterparty_name, t.counterparty_iban, t.category, t.is_manual_category, t.invoice_id, t.status, t.created_utc
            FROM bank_transactions t
            INNER JOIN bank_accounts a ON a.account_id = t.account_id
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE c.company_id = $1 AND c.status = 'active'
            ORDER BY t.booking_date DESC, t.created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(company_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list recent transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn company_expense_transactions(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["company_expense_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT t.transaction_id, t.account_id, t.external_id, t.dedup_key, t.amount, t.currency, t.booking_date, t.value_date, t.description, t.reference, t.counterparty_name, t.counterparty_iban, t.category, t.is_manual_category, t.invoice_id, t.status, t.created_utc
            FROM bank_transactions t
            INNER JOIN bank_accounts a ON a.account_id = t.account_id
            INNER JOIN bank_connections c ON c.connection_id = a.connection_id
            WHERE c.company_id = $1 AND c.status = 'active' AND t.amount < 0
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list expense transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn set_transaction_category(
        &self,
        transaction_id: Uuid,
        category: &str,
        manual: bool,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_transaction_category"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET category = $2, is_manual_category = $3
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(category)
        .bind(manual)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set category: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn link_invoice(
        &self,
        transaction_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["link_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET invoice_id = $2
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to link invoice: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn invoice_exists(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_exists"])
            .start_timer();

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT invoice_id FROM invoices WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check invoice: {}", e)))?;

        timer.observe_duration();
        Ok(row.is_some())
    }

    // =========================================================================
    // Category rules
    // =========================================================================

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id))]
    async fn create_rule(&self, rule: &CategoryRule) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rule"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO category_rules (rule_id, company_id, name, pattern, is_regex, field, category, priority, is_active, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.rule_id)
        .bind(rule.company_id)
        .bind(&rule.name)
        .bind(&rule.pattern)
        .bind(rule.is_regex)
        .bind(&rule.field)
        .bind(&rule.category)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create rule: {}", e)))?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, "Category rule created");
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update_rule(
        &self,
        company_id: Uuid,
        rule_id: Uuid,
        update: RuleUpdate,
    ) -> Result<Option<CategoryRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_rule"])
            .start_timer();

        let field = update.field.map(|f| f.as_str().to_string());
        let rule = sqlx::query_as::<_, CategoryRule>(
            r#"
            UPDATE category_rules
            SET name = COALESCE($3, name),
                pattern = COALESCE($4, pattern),
                is_regex = COALESCE($5, is_regex),
                field = COALESCE($6, field),
                category = COALESCE($7, category),
                priority = COALESCE($8, priority),
                is_active = COALESCE($9, is_active)
            WHERE company_id = $1 AND rule_id = $2
            RETURNING rule_id, company_id, name, pattern, is_regex, field, category, priority, is_active, created_utc
            "#,
        )
        .bind(company_id)
        .bind(rule_id)
        .bind(update.name)
        .bind(update.pattern)
        .bind(update.is_regex)
        .bind(field)
        .bind(update.category)
        .bind(update.priority)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update rule: {}", e)))?;

        timer.observe_duration();
        Ok(rule)
    }

    #[instrument(skip(self))]
    async fn list_rules(
        &self,
        company_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<CategoryRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, CategoryRule>(
            r#"
            SELECT rule_id, company_id, name, pattern, is_regex, field, category, priority, is_active, created_utc
            FROM category_rules
            WHERE company_id = $1 AND ($2 = FALSE OR is_active = TRUE)
            ORDER BY priority, rule_id
            "#,
        )
        .bind(company_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list rules: {}", e)))?;

        timer.observe_duration();
        Ok(rules)
    }
}
