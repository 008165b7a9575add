//! Common test utilities: in-memory store, scripted bank gateway, and a
//! spawned application instance bound to a random port.

#![allow(dead_code)]

use async_trait::async_trait;
use banking_service::config::{Config, DatabaseConfig, ServerConfig, SyncConfig};
use banking_service::models::{
    BankAccount, BankConnection, BankTransaction, CategoryRule, ConnectionStatus, ConsentAccess,
    ConsentRecord, ConsentStatus, NewBankAccount, NewBankTransaction, ProviderConfig, RuleField,
};
use banking_service::services::store::{BankingStore, RuleUpdate};
use banking_service::services::xs2a::{
    AccountBalances, BankGateway, ConsentSubmission, GatewayError, ProviderConsent,
    RemoteTransaction,
};
use banking_service::startup::Application;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,banking_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct Inner {
    provider_configs: HashMap<Uuid, ProviderConfig>,
    consents: HashMap<String, ConsentRecord>,
    connections: HashMap<Uuid, BankConnection>,
    accounts: HashMap<Uuid, BankAccount>,
    transactions: HashMap<Uuid, BankTransaction>,
    rules: HashMap<Uuid, CategoryRule>,
    sync_calls: Vec<(Uuid, DateTime<Utc>)>,
    invoices: HashSet<Uuid>,
}

/// In-memory `BankingStore` with the same visible semantics as the Postgres
/// implementation, plus fault injection for the mid-batch failure tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// When set, the next `commit_sync_batch` persists this many rows and
    /// then fails, leaving `last_sync_utc` untouched.
    fail_commit_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_commit_after(&self, inserts: usize) {
        *self.fail_commit_after.lock().unwrap() = Some(inserts);
    }

    pub fn insert_invoice(&self, invoice_id: Uuid) {
        self.inner.lock().unwrap().invoices.insert(invoice_id);
    }

    pub fn transaction_count(&self, account_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .count()
    }

    pub fn connection_status(&self, connection_id: Uuid) -> Option<ConnectionStatus> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(&connection_id)
            .map(|c| c.status())
    }

    pub fn account_last_sync(&self, account_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .get(&account_id)
            .and_then(|a| a.last_sync_utc)
    }

    /// Seed a connection with its consent, bypassing the bank round-trip.
    pub fn seed_connection(
        &self,
        company_id: Uuid,
        status: ConnectionStatus,
        consent_status: ConsentStatus,
        valid_until: NaiveDate,
        frequency_per_day: i32,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        let consent_id = format!("consent-{}", connection_id);
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.consents.insert(
            consent_id.clone(),
            ConsentRecord {
                consent_id: consent_id.clone(),
                company_id,
                access: full_access(),
                recurring_indicator: true,
                frequency_per_day,
                valid_until,
                status: consent_status,
                created_utc: now,
            },
        );
        inner.connections.insert(
            connection_id,
            BankConnection {
                connection_id,
                company_id,
                name: "Test Bank".into(),
                provider: "testbank".into(),
                consent_id,
                status: status.as_str().to_string(),
                valid_until,
                created_utc: now,
                updated_utc: now,
            },
        );
        connection_id
    }

    pub fn seed_account(&self, connection_id: Uuid, iban: &str, balance: &str) -> Uuid {
        let account_id = Uuid::new_v4();
        let balance: Decimal = balance.parse().unwrap();
        self.inner.lock().unwrap().accounts.insert(
            account_id,
            BankAccount {
                account_id,
                connection_id,
                resource_id: format!("res-{}", account_id),
                iban: iban.to_string(),
                currency: "EUR".into(),
                balance,
                available_balance: balance,
                last_sync_utc: None,
                is_active: true,
                created_utc: Utc::now(),
            },
        );
        account_id
    }

    pub fn seed_transaction(
        &self,
        account_id: Uuid,
        amount: &str,
        description: &str,
        category: Option<&str>,
    ) -> Uuid {
        let transaction_id = Uuid::new_v4();
        self.inner.lock().unwrap().transactions.insert(
            transaction_id,
            BankTransaction {
                transaction_id,
                account_id,
                external_id: None,
                dedup_key: transaction_id.to_string(),
                amount: amount.parse().unwrap(),
                currency: "EUR".into(),
                booking_date: Utc::now().date_naive(),
                value_date: None,
                description: description.to_string(),
                reference: None,
                counterparty_name: None,
                counterparty_iban: None,
                category: category.map(String::from),
                is_manual_category: false,
                invoice_id: None,
                status: "booked".into(),
                created_utc: Utc::now(),
            },
        );
        transaction_id
    }

    fn company_account_ids(inner: &Inner, company_id: Uuid) -> HashSet<Uuid> {
        inner
            .accounts
            .values()
            .filter(|a| {
                inner
                    .connections
                    .get(&a.connection_id)
                    .map(|c| c.company_id == company_id && c.status() == ConnectionStatus::Active)
                    .unwrap_or(false)
            })
            .map(|a| a.account_id)
            .collect()
    }
}

#[async_trait]
impl BankingStore for MemoryStore {
    async fn upsert_provider_config(&self, cfg: &ProviderConfig) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .provider_configs
            .insert(cfg.company_id, cfg.clone());
        Ok(())
    }

    async fn get_provider_config(
        &self,
        company_id: Uuid,
    ) -> Result<Option<ProviderConfig>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .provider_configs
            .get(&company_id)
            .cloned())
    }

    async fn create_consent(&self, consent: &ConsentRecord) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .consents
            .insert(consent.consent_id.clone(), consent.clone());
        Ok(())
    }

    async fn get_consent(&self, consent_id: &str) -> Result<Option<ConsentRecord>, AppError> {
        Ok(self.inner.lock().unwrap().consents.get(consent_id).cloned())
    }

    async fn update_consent_status(
        &self,
        consent_id: &str,
        status: ConsentStatus,
    ) -> Result<(), AppError> {
        if let Some(consent) = self.inner.lock().unwrap().consents.get_mut(consent_id) {
            consent.status = status;
        }
        Ok(())
    }

    async fn create_connection(&self, connection: &BankConnection) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .insert(connection.connection_id, connection.clone());
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<BankConnection>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .connections
            .get(&connection_id)
            .cloned())
    }

    async fn list_connections(&self, company_id: Uuid) -> Result<Vec<BankConnection>, AppError> {
        let mut connections: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| c.company_id == company_id)
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(connections)
    }

    async fn set_connection_status(
        &self,
        connection_id: Uuid,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.connections.get_mut(&connection_id) {
            Some(c) if c.status() == from => {
                c.status = to.as_str().to_string();
                c.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_overdue_connections(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<BankConnection>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| !c.status().is_terminal() && c.valid_until < today)
            .cloned()
            .collect())
    }

    async fn upsert_accounts(
        &self,
        connection_id: Uuid,
        accounts: &[NewBankAccount],
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        for new in accounts {
            let exists = inner
                .accounts
                .values()
                .any(|a| a.connection_id == connection_id && a.resource_id == new.resource_id);
            if exists {
                continue;
            }
            let account_id = Uuid::new_v4();
            inner.accounts.insert(
                account_id,
                BankAccount {
                    account_id,
                    connection_id,
                    resource_id: new.resource_id.clone(),
                    iban: new.iban.clone(),
                    currency: new.currency.clone(),
                    balance: Decimal::ZERO,
                    available_balance: Decimal::ZERO,
                    last_sync_utc: None,
                    is_active: true,
                    created_utc: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<BankAccount>, AppError> {
        Ok(self.inner.lock().unwrap().accounts.get(&account_id).cloned())
    }

    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankAccount>, AppError> {
        let mut accounts: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .accounts
            .values()
            .filter(|a| a.connection_id == connection_id && a.is_active)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.iban.cmp(&b.iban));
        Ok(accounts)
    }

    async fn list_company_accounts(&self, company_id: Uuid) -> Result<Vec<BankAccount>, AppError> {
        let inner = self.inner.lock().unwrap();
        let ids = Self::company_account_ids(&inner, company_id);
        let mut accounts: Vec<_> = inner
            .accounts
            .values()
            .filter(|a| ids.contains(&a.account_id) && a.is_active)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.iban.cmp(&b.iban));
        Ok(accounts)
    }

    async fn deactivate_accounts(&self, connection_id: Uuid) -> Result<(), AppError> {
        for account in self
            .inner
            .lock()
            .unwrap()
            .accounts
            .values_mut()
            .filter(|a| a.connection_id == connection_id)
        {
            account.is_active = false;
        }
        Ok(())
    }

    async fn count_sync_calls(&self, connection_id: Uuid, day: NaiveDate) -> Result<i64, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sync_calls
            .iter()
            .filter(|(id, at)| *id == connection_id && at.date_naive() == day)
            .count() as i64)
    }

    async fn record_sync_call(
        &self,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.inner.lock().unwrap().sync_calls.push((connection_id, at));
        Ok(())
    }

    async fn existing_dedup_keys(
        &self,
        account_id: Uuid,
        keys: &[String],
    ) -> Result<HashSet<String>, AppError> {
        let wanted: HashSet<&String> = keys.iter().collect();
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|t| t.account_id == account_id && wanted.contains(&t.dedup_key))
            .map(|t| t.dedup_key.clone())
            .collect())
    }

    async fn commit_sync_batch(
        &self,
        account_id: Uuid,
        balance: Decimal,
        available_balance: Decimal,
        transactions: &[NewBankTransaction],
        synced_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let fail_after = self.fail_commit_after.lock().unwrap().take();
        let mut inner = self.inner.lock().unwrap();

        let existing: HashSet<String> = inner
            .transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .map(|t| t.dedup_key.clone())
            .collect();

        let mut inserted = 0;
        for new in transactions {
            if let Some(limit) = fail_after {
                if inserted >= limit {
                    return Err(AppError::DatabaseError(anyhow::anyhow!(
                        "Simulated write failure after {} inserts",
                        inserted
                    )));
                }
            }
            if existing.contains(&new.dedup_key) {
                continue;
            }
            let transaction_id = Uuid::new_v4();
            inner.transactions.insert(
                transaction_id,
                BankTransaction {
                    transaction_id,
                    account_id,
                    external_id: new.external_id.clone(),
                    dedup_key: new.dedup_key.clone(),
                    amount: new.amount,
                    currency: new.currency.clone(),
                    booking_date: new.booking_date,
                    value_date: new.value_date,
                    description: new.description.clone(),
                    reference: new.reference.clone(),
                    counterparty_name: new.counterparty_name.clone(),
                    counterparty_iban: new.counterparty_iban.clone(),
                    category: new.category.clone(),
                    is_manual_category: false,
                    invoice_id: None,
                    status: new.status.clone(),
                    created_utc: Utc::now(),
                },
            );
            inserted += 1;
        }

        if let Some(account) = inner.accounts.get_mut(&account_id) {
            account.balance = balance;
            account.available_balance = available_balance;
            account.last_sync_utc = Some(synced_at);
        }
        Ok(inserted)
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .get(&transaction_id)
            .cloned())
    }

    async fn list_account_transactions(
        &self,
        account_id: Uuid,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let mut transactions: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|t| {
                t.account_id == account_id
                    && date_from.map(|d| t.booking_date >= d).unwrap_or(true)
                    && date_to.map(|d| t.booking_date <= d).unwrap_or(true)
            })
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.booking_date.cmp(&a.booking_date));
        Ok(transactions)
    }

    async fn recent_company_transactions(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let inner = self.inner.lock().unwrap();
        let ids = Self::company_account_ids(&inner, company_id);
        let mut transactions: Vec<_> = inner
            .transactions
            .values()
            .filter(|t| ids.contains(&t.account_id))
            .cloned()
            .collect();
        transactions.sort_by(|a, b| {
            b.booking_date
                .cmp(&a.booking_date)
                .then(b.created_utc.cmp(&a.created_utc))
        });
        transactions.truncate(limit as usize);
        Ok(transactions)
    }

    async fn company_expense_transactions(
        &self,
        company_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let inner = self.inner.lock().unwrap();
        let ids = Self::company_account_ids(&inner, company_id);
        Ok(inner
            .transactions
            .values()
            .filter(|t| ids.contains(&t.account_id) && t.amount < Decimal::ZERO)
            .cloned()
            .collect())
    }

    async fn set_transaction_category(
        &self,
        transaction_id: Uuid,
        category: &str,
        manual: bool,
    ) -> Result<(), AppError> {
        if let Some(t) = self
            .inner
            .lock()
            .unwrap()
            .transactions
            .get_mut(&transaction_id)
        {
            t.category = Some(category.to_string());
            t.is_manual_category = manual;
        }
        Ok(())
    }

    async fn link_invoice(&self, transaction_id: Uuid, invoice_id: Uuid) -> Result<(), AppError> {
        if let Some(t) = self
            .inner
            .lock()
            .unwrap()
            .transactions
            .get_mut(&transaction_id)
        {
            t.invoice_id = Some(invoice_id);
        }
        Ok(())
    }

    async fn invoice_exists(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        Ok(self.inner.lock().unwrap().invoices.contains(&invoice_id))
    }

    async fn create_rule(&self, rule: &CategoryRule) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .rules
            .insert(rule.rule_id, rule.clone());
        Ok(())
    }

    async fn update_rule(
        &self,
        company_id: Uuid,
        rule_id: Uuid,
        update: RuleUpdate,
    ) -> Result<Option<CategoryRule>, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(rule) = inner
            .rules
            .get_mut(&rule_id)
            .filter(|r| r.company_id == company_id)
        else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(pattern) = update.pattern {
            rule.pattern = pattern;
        }
        if let Some(is_regex) = update.is_regex {
            rule.is_regex = is_regex;
        }
        if let Some(field) = update.field {
            rule.field = field.as_str().to_string();
        }
        if let Some(category) = update.category {
            rule.category = category;
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
        }
        if let Some(is_active) = update.is_active {
            rule.is_active = is_active;
        }
        Ok(Some(rule.clone()))
    }

    async fn list_rules(
        &self,
        company_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<CategoryRule>, AppError> {
        let mut rules: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .rules
            .values()
            .filter(|r| r.company_id == company_id && (!active_only || r.is_active))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.rule_id.cmp(&b.rule_id)));
        Ok(rules)
    }
}

// ============================================================================
// Scripted bank gateway
// ============================================================================

#[derive(Default)]
pub struct GatewayCalls {
    pub create_consent: AtomicUsize,
    pub consent_status: AtomicUsize,
    pub list_accounts: AtomicUsize,
    pub balances: AtomicUsize,
    pub transactions: AtomicUsize,
}

/// Scripted `BankGateway`: tests enqueue consent statuses and canned
/// account/transaction payloads, and assert on the recorded call counts.
pub struct MockGateway {
    pub calls: GatewayCalls,
    consent_statuses: Mutex<VecDeque<ConsentStatus>>,
    accounts: Mutex<Vec<NewBankAccount>>,
    balances: Mutex<AccountBalances>,
    transactions: Mutex<Vec<RemoteTransaction>>,
    next_balances_error: Mutex<Option<GatewayError>>,
    next_transactions_error: Mutex<Option<GatewayError>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            calls: GatewayCalls::default(),
            consent_statuses: Mutex::new(VecDeque::new()),
            accounts: Mutex::new(vec![NewBankAccount {
                resource_id: "res-1".into(),
                iban: "ES9121000418450200051332".into(),
                currency: "EUR".into(),
            }]),
            balances: Mutex::new(AccountBalances {
                balance: Decimal::ZERO,
                available_balance: Decimal::ZERO,
            }),
            transactions: Mutex::new(Vec::new()),
            next_balances_error: Mutex::new(None),
            next_transactions_error: Mutex::new(None),
        }
    }
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_consent_status(&self, status: ConsentStatus) {
        self.consent_statuses.lock().unwrap().push_back(status);
    }

    pub fn set_accounts(&self, accounts: Vec<NewBankAccount>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    pub fn set_balances(&self, balance: &str, available: &str) {
        *self.balances.lock().unwrap() = AccountBalances {
            balance: balance.parse().unwrap(),
            available_balance: available.parse().unwrap(),
        };
    }

    pub fn set_transactions(&self, transactions: Vec<RemoteTransaction>) {
        *self.transactions.lock().unwrap() = transactions;
    }

    pub fn fail_next_balances(&self, err: GatewayError) {
        *self.next_balances_error.lock().unwrap() = Some(err);
    }

    pub fn fail_next_transactions(&self, err: GatewayError) {
        *self.next_transactions_error.lock().unwrap() = Some(err);
    }

    pub fn sync_call_count(&self) -> usize {
        self.calls.balances.load(Ordering::SeqCst) + self.calls.transactions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BankGateway for MockGateway {
    async fn create_consent(
        &self,
        _cfg: &ProviderConfig,
        _submission: &ConsentSubmission,
    ) -> Result<ProviderConsent, GatewayError> {
        let n = self.calls.create_consent.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderConsent {
            consent_id: format!("consent-{}", n + 1),
            status: ConsentStatus::Received,
            sca_redirect: Some("https://bank.example/sca/abc".into()),
        })
    }

    async fn consent_status(
        &self,
        _cfg: &ProviderConfig,
        _consent_id: &str,
    ) -> Result<ConsentStatus, GatewayError> {
        self.calls.consent_status.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .consent_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConsentStatus::Received))
    }

    async fn list_accounts(
        &self,
        _cfg: &ProviderConfig,
        _consent_id: &str,
    ) -> Result<Vec<NewBankAccount>, GatewayError> {
        self.calls.list_accounts.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn balances(
        &self,
        _cfg: &ProviderConfig,
        _consent_id: &str,
        _resource_id: &str,
    ) -> Result<AccountBalances, GatewayError> {
        self.calls.balances.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_balances_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(*self.balances.lock().unwrap())
    }

    async fn transactions(
        &self,
        _cfg: &ProviderConfig,
        _consent_id: &str,
        _resource_id: &str,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
    ) -> Result<Vec<RemoteTransaction>, GatewayError> {
        self.calls.transactions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_transactions_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.transactions.lock().unwrap().clone())
    }
}

// ============================================================================
// Test application
// ============================================================================

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        database: DatabaseConfig {
            url: Secret::new("postgres://unused".into()),
            max_connections: 2,
            min_connections: 1,
        },
        sync: SyncConfig {
            request_timeout_secs: 5,
            // Keep transient retries short so failure tests finish quickly.
            retry_max_elapsed_secs: 1,
            balance_snapshot_ttl_secs: 900,
            expiry_sweep_interval_secs: 3600,
        },
        service_name: "banking-service-test".into(),
        log_level: "debug".into(),
    }
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub company_id: Uuid,
}

impl TestApp {
    /// Spawn the full HTTP application against the in-memory collaborators,
    /// with a provider config already seeded for `company_id`.
    pub async fn spawn(store: Arc<MemoryStore>, gateway: Arc<MockGateway>) -> TestApp {
        init_tracing();

        let app = Application::build_with(test_config(), store.clone(), gateway.clone())
            .await
            .expect("Failed to build application");
        let port = app.port();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let address = format!("http://127.0.0.1:{}", port);
        let client = reqwest::Client::new();

        // Wait for the server to accept requests.
        let mut attempts = 0;
        loop {
            match client.get(format!("{}/health", address)).send().await {
                Ok(resp) if resp.status().is_success() => break,
                _ if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                other => panic!("Server did not become healthy: {:?}", other),
            }
        }

        let company_id = Uuid::new_v4();
        store
            .upsert_provider_config(&provider_config(company_id))
            .await
            .expect("Failed to seed provider config");

        TestApp {
            address,
            client,
            store,
            gateway,
            company_id,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn provider_config(company_id: Uuid) -> ProviderConfig {
    ProviderConfig {
        company_id,
        api_url: "https://xs2a.testbank.example".into(),
        client_id: "client-1".into(),
        client_secret: "secret".into(),
        redirect_uri: "https://app.example/banking/callback".into(),
        cert_path: None,
        key_path: None,
        updated_utc: Utc::now(),
    }
}

pub fn full_access() -> ConsentAccess {
    ConsentAccess {
        accounts: vec!["ES9121000418450200051332".into()],
        balances: vec!["ES9121000418450200051332".into()],
        transactions: vec!["ES9121000418450200051332".into()],
        all_psd2: None,
    }
}

pub fn remote_transaction(external_id: Option<&str>, amount: &str, description: &str) -> RemoteTransaction {
    RemoteTransaction {
        external_id: external_id.map(String::from),
        amount: amount.parse().unwrap(),
        currency: "EUR".into(),
        booking_date: Utc::now().date_naive(),
        value_date: None,
        description: description.to_string(),
        reference: None,
        counterparty_name: None,
        counterparty_iban: None,
    }
}

pub fn category_rule(
    company_id: Uuid,
    priority: i32,
    pattern: &str,
    category: &str,
) -> CategoryRule {
    CategoryRule {
        rule_id: Uuid::new_v4(),
        company_id,
        name: format!("rule-{}", category),
        pattern: pattern.to_string(),
        is_regex: false,
        field: RuleField::Description.as_str().to_string(),
        category: category.to_string(),
        priority,
        is_active: true,
        created_utc: Utc::now(),
    }
}
