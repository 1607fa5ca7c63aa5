//! Batch reconciliation of stored pet life stages.

mod common;

use chrono::{Months, NaiveDate};
use common::*;
use subscription_service::services::LifeStageReconciler;
use uuid::Uuid;

async fn stored_stage(app: &common::TestApp, pet_id: Uuid) -> Option<i32> {
    sqlx::query_scalar("SELECT life_stage_id FROM pets WHERE pet_id = $1")
        .bind(pet_id)
        .fetch_one(app.db.pool())
        .await
        .unwrap()
}

fn born_months_before(as_of: NaiveDate, months: u32) -> NaiveDate {
    as_of.checked_sub_months(Months::new(months)).unwrap()
}

#[tokio::test]
async fn stale_life_stages_are_corrected_once() {
    let app = spawn_or_skip!();
    let owner = Uuid::new_v4();
    let as_of = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();

    // Grew up, correct, never assigned, no birth date.
    let grown = app
        .insert_pet(owner, Some(born_months_before(as_of, 14)), Some(PUPPY))
        .await;
    let correct = app
        .insert_pet(owner, Some(born_months_before(as_of, 40)), Some(ADULT))
        .await;
    let unassigned = app
        .insert_pet(owner, Some(born_months_before(as_of, 100)), None)
        .await;
    let unknown_age = app.insert_pet(owner, None, Some(ADULT)).await;

    let reconciler = LifeStageReconciler::new(app.db.clone(), 100);
    let summary = reconciler.update_all_as_of(as_of).await.unwrap();
    assert_eq!(summary.updated_count, 2);

    assert_eq!(stored_stage(&app, grown).await, Some(ADULT));
    assert_eq!(stored_stage(&app, correct).await, Some(ADULT));
    assert_eq!(stored_stage(&app, unassigned).await, Some(SENIOR));
    assert_eq!(stored_stage(&app, unknown_age).await, Some(ADULT));

    let again = reconciler.update_all_as_of(as_of).await.unwrap();
    assert_eq!(again.updated_count, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn reconciliation_pages_through_small_batches() {
    let app = spawn_or_skip!();
    let owner = Uuid::new_v4();
    let as_of = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();

    for _ in 0..7 {
        app.insert_pet(owner, Some(born_months_before(as_of, 20)), Some(PUPPY))
            .await;
    }

    let reconciler = LifeStageReconciler::new(app.db.clone(), 3);
    let summary = reconciler.update_all_as_of(as_of).await.unwrap();
    assert_eq!(summary.updated_count, 7);
    assert_eq!(summary.scanned_count, 7);
    assert!(summary.batches >= 3);

    let remaining_puppies: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pets WHERE owner_id = $1 AND life_stage_id = $2",
    )
    .bind(owner)
    .bind(PUPPY)
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(remaining_puppies, 0);

    app.cleanup().await;
}
