//! Quota metering, including concurrent consumption against one row.

mod common;

use chrono::{Duration, Utc};
use common::*;
use subscription_service::services::{ErrorKind, SubscriptionError};
use uuid::Uuid;

#[tokio::test]
async fn bounded_quota_is_consumed_until_exhausted() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, PLUS_TIER, MONTHLY).await;
    let entitlements = app.service.entitlements();

    // Plus monthly allows four consultations.
    let after = entitlements
        .use_entitlement(sub.subscription_id, CONSULTATION, 3)
        .await
        .expect("Failed to consume");
    assert_eq!(after.quota_used, 3);
    assert_eq!(after.quota_remaining, Some(1));
    assert!(after.last_used_utc.is_some());

    let check = entitlements
        .check_entitlement(sub.subscription_id, CONSULTATION, 2)
        .await
        .unwrap();
    assert!(!check.has_access);
    assert_eq!(check.quota_remaining, Some(1));

    let err = entitlements
        .use_entitlement(sub.subscription_id, CONSULTATION, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubscriptionError::QuotaExceeded {
            remaining: 1,
            requested: 2,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);

    // The failed attempt changed nothing.
    let rows = app
        .service
        .list_entitlements(sub.subscription_id, user_id)
        .await
        .unwrap();
    let consult = rows.iter().find(|e| e.category_id == CONSULTATION).unwrap();
    assert_eq!(consult.quota_used, 3);
    assert_eq!(consult.quota_remaining, Some(1));

    let last = entitlements
        .use_entitlement(sub.subscription_id, CONSULTATION, 1)
        .await
        .unwrap();
    assert_eq!(last.quota_remaining, Some(0));
    assert_eq!(last.quota_used + last.quota_remaining.unwrap(), 4);

    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_consumption_never_overdraws() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    // Basic annual: 24 consultations.
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, ANNUAL).await;

    let mut handles = Vec::new();
    for _ in 0..30 {
        let manager = app.service.entitlements().clone();
        let subscription_id = sub.subscription_id;
        handles.push(tokio::spawn(async move {
            manager
                .use_entitlement(subscription_id, CONSULTATION, 1)
                .await
        }));
    }

    let mut consumed = 0;
    let mut exceeded = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => consumed += 1,
            Err(SubscriptionError::QuotaExceeded { .. }) => exceeded += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(consumed, 24);
    assert_eq!(exceeded, 6);

    let rows = app
        .service
        .list_entitlements(sub.subscription_id, user_id)
        .await
        .unwrap();
    let consult = rows.iter().find(|e| e.category_id == CONSULTATION).unwrap();
    assert_eq!(consult.quota_used, 24);
    assert_eq!(consult.quota_remaining, Some(0));

    app.cleanup().await;
}

#[tokio::test]
async fn unlimited_and_excluded_categories() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let eternal_pet = app.insert_adult_dog(user_id).await;
    let basic_pet = app.insert_adult_dog(user_id).await;
    let eternal = app.subscribe(user_id, eternal_pet, ETERNAL_TIER, MONTHLY).await;
    let basic = app.subscribe(user_id, basic_pet, BASIC_TIER, MONTHLY).await;
    let entitlements = app.service.entitlements();

    let check = entitlements
        .check_entitlement(eternal.subscription_id, CONSULTATION, 1_000)
        .await
        .unwrap();
    assert!(check.has_access);
    assert!(check.is_unlimited);

    let used = entitlements
        .use_entitlement(eternal.subscription_id, CONSULTATION, 50)
        .await
        .unwrap();
    assert_eq!(used.quota_total, None);
    assert_eq!(used.quota_remaining, None);
    assert_eq!(used.quota_used, 50);

    let check = entitlements
        .check_entitlement(basic.subscription_id, GROOMING, 1)
        .await
        .unwrap();
    assert!(!check.is_included);

    let err = entitlements
        .use_entitlement(basic.subscription_id, GROOMING, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::ServiceNotIncluded(GROOMING)));

    let err = entitlements
        .use_entitlement(basic.subscription_id, VACCINATION, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidQuantity(0)));

    app.cleanup().await;
}

#[tokio::test]
async fn due_quotas_are_refilled() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;
    let entitlements = app.service.entitlements();

    entitlements
        .use_entitlement(sub.subscription_id, CONSULTATION, 2)
        .await
        .unwrap();

    // Not due yet.
    assert_eq!(entitlements.reset_due_entitlements(Utc::now()).await.unwrap(), 0);

    sqlx::query(
        "UPDATE subscription_entitlements SET reset_date = $2 WHERE subscription_id = $1",
    )
    .bind(sub.subscription_id)
    .bind(Utc::now() - Duration::days(1))
    .execute(app.db.pool())
    .await
    .unwrap();

    let reset = entitlements.reset_due_entitlements(Utc::now()).await.unwrap();
    assert_eq!(reset, 2);

    let rows = app
        .service
        .list_entitlements(sub.subscription_id, user_id)
        .await
        .unwrap();
    for row in &rows {
        assert_eq!(row.quota_used, 0);
        assert_eq!(row.quota_remaining, row.quota_total);
        assert!(row.reset_date > Utc::now());
    }

    app.cleanup().await;
}
