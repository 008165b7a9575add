//! Sync engine behavior against the in-memory store and a scripted gateway.

mod common;

use banking_service::models::{ConnectionStatus, ConsentStatus};
use banking_service::services::store::BankingStore;
use banking_service::services::sync::SyncEngine;
use banking_service::services::xs2a::GatewayError;
use chrono::{Duration as ChronoDuration, Utc};
use common::{category_rule, remote_transaction, MemoryStore, MockGateway};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn engine(store: &Arc<MemoryStore>, gateway: &Arc<MockGateway>) -> SyncEngine {
    SyncEngine::new(store.clone(), gateway.clone(), Duration::from_secs(2))
}

async fn seed_company(store: &Arc<MemoryStore>) -> Uuid {
    let company_id = Uuid::new_v4();
    store
        .upsert_provider_config(&common::provider_config(company_id))
        .await
        .unwrap();
    company_id
}

fn future_date() -> chrono::NaiveDate {
    Utc::now().date_naive() + ChronoDuration::days(90)
}

#[tokio::test]
async fn sync_at_daily_cap_returns_rate_limited_without_bank_call() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        1,
    );
    store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    gateway.set_balances("10.00", "10.00");

    let engine = engine(&store, &gateway);
    engine.sync_connection(connection_id, None).await.unwrap();
    let calls_after_first = gateway.sync_call_count();
    assert!(calls_after_first > 0);

    let err = engine.sync_connection(connection_id, None).await.unwrap_err();
    match err {
        AppError::RateLimited(_, retry_after) => {
            let secs = retry_after.expect("Retry-After hint missing");
            assert!(secs <= 86_400);
        }
        other => panic!("Expected RateLimited, got {:?}", other),
    }
    // The capped attempt never reached the bank.
    assert_eq!(gateway.sync_call_count(), calls_after_first);
}

#[tokio::test]
async fn pending_connection_cannot_sync() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Pending,
        ConsentStatus::Received,
        future_date(),
        4,
    );

    let err = engine(&store, &gateway)
        .sync_connection(connection_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConsentNotYetAuthorized(_)));
    assert_eq!(gateway.sync_call_count(), 0);
}

#[tokio::test]
async fn expired_consent_transitions_connection_before_any_bank_call() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        Utc::now().date_naive() - ChronoDuration::days(1),
        4,
    );

    let err = engine(&store, &gateway)
        .sync_connection(connection_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConsentExpired(_)));
    assert_eq!(
        store.connection_status(connection_id),
        Some(ConnectionStatus::Expired)
    );
    assert_eq!(gateway.sync_call_count(), 0);
}

#[tokio::test]
async fn unauthorized_from_bank_expires_connection_without_retry() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        4,
    );
    store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    gateway.fail_next_balances(GatewayError::Unauthorized("consent revoked at bank".into()));

    let err = engine(&store, &gateway)
        .sync_connection(connection_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ConsentExpired(_)));
    assert_eq!(
        store.connection_status(connection_id),
        Some(ConnectionStatus::Expired)
    );
    // One balances call, no retries on 401.
    assert_eq!(
        gateway.calls.balances.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn transient_bank_error_is_retried() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        4,
    );
    store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    gateway.set_balances("42.00", "40.00");
    gateway.fail_next_balances(GatewayError::Transient("503 from bank".into()));

    let outcome = engine(&store, &gateway)
        .sync_connection(connection_id, None)
        .await
        .unwrap();
    assert_eq!(outcome.accounts_synced, 1);
    assert!(
        gateway.calls.balances.load(std::sync::atomic::Ordering::SeqCst) >= 2,
        "transient failure should have been retried"
    );
}

#[tokio::test]
async fn mid_batch_failure_leaves_last_sync_unset_and_retry_dedups() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        10,
    );
    let account_id = store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    gateway.set_balances("100.00", "100.00");
    gateway.set_transactions(vec![
        remote_transaction(Some("T1"), "-10.00", "ENDESA ELECTRICIDAD"),
        remote_transaction(Some("T2"), "-20.00", "SUPERMERCADO"),
        remote_transaction(Some("T3"), "300.00", "CLIENTE ABC"),
    ]);

    let engine = engine(&store, &gateway);

    store.fail_next_commit_after(1);
    let err = engine.sync_connection(connection_id, None).await.unwrap_err();
    assert!(matches!(err, AppError::DatabaseError(_)));
    assert_eq!(store.transaction_count(account_id), 1);
    assert!(
        store.account_last_sync(account_id).is_none(),
        "failed batch must not advance last_sync"
    );

    // The retry re-fetches the same window and dedups the surviving row.
    let outcome = engine.sync_connection(connection_id, None).await.unwrap();
    assert_eq!(outcome.transactions_inserted, 2);
    assert_eq!(store.transaction_count(account_id), 3);
    assert!(store.account_last_sync(account_id).is_some());
}

#[tokio::test]
async fn repeated_sync_inserts_nothing_new() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        10,
    );
    let account_id = store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    gateway.set_balances("5.00", "5.00");
    gateway.set_transactions(vec![
        remote_transaction(Some("T1"), "-10.00", "ENDESA"),
        // Duplicate bank id within one batch collapses to a single row.
        remote_transaction(Some("T1"), "-10.00", "ENDESA"),
    ]);

    let engine = engine(&store, &gateway);
    let first = engine.sync_connection(connection_id, None).await.unwrap();
    assert_eq!(first.transactions_inserted, 1);

    let second = engine.sync_connection(connection_id, None).await.unwrap();
    assert_eq!(second.transactions_inserted, 0);
    assert_eq!(store.transaction_count(account_id), 1);
}

#[tokio::test]
async fn incoming_transactions_are_categorized_before_commit() {
    let store = MemoryStore::new();
    let gateway = MockGateway::new();
    let company_id = seed_company(&store).await;
    let connection_id = store.seed_connection(
        company_id,
        ConnectionStatus::Active,
        ConsentStatus::Valid,
        future_date(),
        10,
    );
    let account_id = store.seed_account(connection_id, "ES9121000418450200051332", "0.00");
    store
        .create_rule(&category_rule(
            company_id,
            1,
            "ELECTRICIDAD|ENDESA",
            "Electricidad",
        ))
        .await
        .unwrap();
    gateway.set_balances("0.00", "0.00");
    gateway.set_transactions(vec![
        remote_transaction(Some("T1"), "-45.00", "Recibo ENDESA marzo"),
        remote_transaction(Some("T2"), "-12.00", "Cafeteria"),
    ]);

    engine(&store, &gateway)
        .sync_connection(connection_id, None)
        .await
        .unwrap();

    let transactions = store
        .list_account_transactions(account_id, None, None)
        .await
        .unwrap();
    let endesa = transactions.iter().find(|t| t.dedup_key == "T1").unwrap();
    assert_eq!(endesa.category.as_deref(), Some("Electricidad"));
    let cafe = transactions.iter().find(|t| t.dedup_key == "T2").unwrap();
    assert_eq!(cafe.category, None);
}
