//! Pause, resume, cancellation and auto-renewal.

mod common;

use chrono::{Duration, Utc};
use common::*;
use subscription_service::models::SubscriptionStatus;
use subscription_service::services::{ErrorKind, SubscriptionError};
use uuid::Uuid;

#[tokio::test]
async fn pause_is_bounded_by_max_pause_days() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;

    let err = app
        .service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "travel",
            Utc::now() + Duration::days(91),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::MaxPauseExceeded { max_days: 90 }));
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);

    let err = app
        .service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "travel",
            Utc::now() + Duration::days(90) + Duration::hours(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::MaxPauseExceeded { .. }));

    let err = app
        .service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "travel",
            Utc::now() - Duration::hours(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidResumeDate));

    let paused = app
        .service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "travel",
            // Exactly at the limit
            Utc::now() + Duration::days(90),
        )
        .await
        .expect("Failed to pause");
    assert_eq!(paused.status(), SubscriptionStatus::Paused);
    assert_eq!(paused.pause_reason.as_deref(), Some("travel"));
    assert!(paused.resume_date.is_some());
    assert!(!paused.grants_access_at(Utc::now()));

    // Already paused.
    let err = app
        .service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "again",
            Utc::now() + Duration::days(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidState { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn resume_reactivates_paused_subscription() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;

    let err = app
        .service
        .resume_subscription(sub.subscription_id, user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidState { .. }));

    app.service
        .pause_subscription(
            sub.subscription_id,
            user_id,
            "vacation",
            Utc::now() + Duration::days(14),
        )
        .await
        .unwrap();

    let resumed = app
        .service
        .resume_subscription(sub.subscription_id, user_id)
        .await
        .expect("Failed to resume");
    assert_eq!(resumed.status(), SubscriptionStatus::Active);
    assert_eq!(resumed.paused_utc, None);
    assert_eq!(resumed.resume_date, None);

    let history = app
        .service
        .get_subscription_history(sub.subscription_id, user_id)
        .await
        .unwrap();
    assert_eq!(history[0].action, "resumed");
    assert_eq!(history[1].action, "paused");

    app.cleanup().await;
}

#[tokio::test]
async fn immediate_cancellation_refunds_unused_days() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;

    let now = Utc::now();
    app.set_period(
        sub.subscription_id,
        now - Duration::days(10),
        now + Duration::days(20),
        dec("900.00"),
    )
    .await;

    let outcome = app
        .service
        .cancel_subscription(sub.subscription_id, user_id, Some("moving"), true)
        .await
        .expect("Failed to cancel");

    assert_eq!(outcome.refund_amount, Some(dec("600.00")));
    assert_eq!(outcome.subscription.status(), SubscriptionStatus::Cancelled);
    assert!(!outcome.subscription.auto_renew);
    assert_eq!(outcome.subscription.cancelled_by, Some(user_id));
    assert!(!outcome.subscription.grants_access_at(Utc::now()));

    // Cancelled is terminal.
    let err = app
        .service
        .cancel_subscription(sub.subscription_id, user_id, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidState { .. }));

    // The pet's slot is free again.
    app.subscribe(user_id, pet_id, PLUS_TIER, MONTHLY).await;

    app.cleanup().await;
}

#[tokio::test]
async fn cancellation_at_period_end_keeps_access() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;

    let outcome = app
        .service
        .cancel_subscription(sub.subscription_id, user_id, None, false)
        .await
        .expect("Failed to cancel");

    assert_eq!(outcome.refund_amount, None);
    assert_eq!(outcome.access_until, sub.current_period_end);
    assert_eq!(outcome.subscription.end_date, Some(sub.current_period_end));
    assert!(outcome.subscription.grants_access_at(Utc::now()));
    assert!(!outcome.subscription.grants_access_at(sub.current_period_end));

    let err = app
        .service
        .toggle_auto_renewal(sub.subscription_id, user_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::InvalidState { .. }));

    app.cleanup().await;
}

#[tokio::test]
async fn auto_renewal_can_be_toggled() {
    let app = spawn_or_skip!();
    let user_id = Uuid::new_v4();
    let pet_id = app.insert_adult_dog(user_id).await;
    let sub = app.subscribe(user_id, pet_id, BASIC_TIER, MONTHLY).await;

    let off = app
        .service
        .toggle_auto_renewal(sub.subscription_id, user_id, false)
        .await
        .unwrap();
    assert!(!off.auto_renew);

    let listed = app
        .service
        .list_user_subscriptions(user_id, Some(SubscriptionStatus::Active))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].auto_renew);

    let err = app
        .service
        .toggle_auto_renewal(sub.subscription_id, Uuid::new_v4(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriptionError::SubscriptionNotFound(_)));

    app.cleanup().await;
}
