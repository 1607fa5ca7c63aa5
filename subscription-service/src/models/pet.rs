//! Pet and life-stage reference data.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pet profile as owned by the pet service. `life_stage_id` is derived
/// from the date of birth by the reconciliation job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pet {
    pub pet_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub species_id: i32,
    pub life_stage_id: Option<i32>,
    pub date_of_birth: Option<NaiveDate>,
    pub is_active: bool,
    pub updated_utc: DateTime<Utc>,
}

/// Age range `[min_age_months, max_age_months)` for one species.
/// An open upper bound covers every older pet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LifeStage {
    pub life_stage_id: i32,
    pub species_id: i32,
    pub life_stage_name: String,
    pub min_age_months: i32,
    pub max_age_months: Option<i32>,
}

impl LifeStage {
    pub fn covers(&self, species_id: i32, age_months: i32) -> bool {
        self.species_id == species_id
            && age_months >= self.min_age_months
            && self.max_age_months.is_none_or(|max| age_months < max)
    }

    /// Stage for a pet of `species_id` aged `age_months`.
    ///
    /// Overlapping ranges resolve to the stage with the highest lower bound.
    pub fn resolve(stages: &[LifeStage], species_id: i32, age_months: i32) -> Option<&LifeStage> {
        stages
            .iter()
            .filter(|s| s.covers(species_id, age_months))
            .max_by_key(|s| s.min_age_months)
    }
}

/// Whole months elapsed between `date_of_birth` and `as_of`.
///
/// Matches PostgreSQL `AGE()`: a month only counts once its day-of-month
/// has been reached. Future birth dates yield zero.
pub fn age_in_months(date_of_birth: NaiveDate, as_of: NaiveDate) -> i32 {
    if as_of <= date_of_birth {
        return 0;
    }
    let mut months = (as_of.year() - date_of_birth.year()) * 12
        + (as_of.month() as i32 - date_of_birth.month() as i32);
    if as_of.day() < date_of_birth.day() {
        months -= 1;
    }
    months.max(0)
}
