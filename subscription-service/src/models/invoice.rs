//! Invoice request handed to the invoice collaborator.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invoice type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Subscription,
    Renewal,
    Upgrade,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Subscription => "subscription",
            InvoiceType::Renewal => "renewal",
            InvoiceType::Upgrade => "upgrade",
        }
    }
}

/// Line item on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl InvoiceLineItem {
    pub fn amount(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// Input for creating an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_type: InvoiceType,
    pub line_items: Vec<InvoiceLineItem>,
    pub tax_percentage: Decimal,
    pub discount_amount: Decimal,
    pub due_date: NaiveDate,
}

impl InvoiceRequest {
    pub fn gross_amount(&self) -> Decimal {
        self.line_items.iter().map(InvoiceLineItem::amount).sum()
    }

    /// Gross minus discount, never negative.
    pub fn subtotal(&self) -> Decimal {
        (self.gross_amount() - self.discount_amount).max(Decimal::ZERO)
    }

    pub fn tax_amount(&self) -> Decimal {
        (self.subtotal() * self.tax_percentage / Decimal::from(100)).round_dp(2)
    }

    pub fn total_amount(&self) -> Decimal {
        self.subtotal().round_dp(2) + self.tax_amount()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_apply_discount_before_tax() {
        let request = InvoiceRequest {
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            invoice_type: InvoiceType::Subscription,
            line_items: vec![InvoiceLineItem {
                description: "Plus plan (monthly)".to_string(),
                quantity: Decimal::ONE,
                unit_price: Decimal::from(1000),
            }],
            tax_percentage: Decimal::from(18),
            discount_amount: Decimal::from(100),
            due_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        };

        assert_eq!(request.subtotal(), Decimal::from(900));
        assert_eq!(request.tax_amount(), Decimal::from(162));
        assert_eq!(request.total_amount(), Decimal::from(1062));
    }
}
