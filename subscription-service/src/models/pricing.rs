//! Price breakdown for a tier, billing cycle and optional promo.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Full pricing computation; amounts are unrounded decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub tier_id: i32,
    pub billing_cycle_id: i32,
    /// Tier monthly price times the months billed.
    pub base_price: Decimal,
    pub cycle_discount: Decimal,
    pub subtotal: Decimal,
    pub promo_id: Option<i32>,
    pub promo_code: Option<String>,
    pub promo_discount: Decimal,
    pub final_price: Decimal,
    pub tax_percentage: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

impl PriceBreakdown {
    /// Everything deducted from `base_price` before tax.
    pub fn total_discount(&self) -> Decimal {
        self.cycle_discount + self.promo_discount
    }
}
