//! Invoice creation inside the caller's transaction.

use crate::models::InvoiceRequest;
use crate::services::error::{db_error, SubscriptionError};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

/// Creates invoices as part of an open transaction, so the invoice commits
/// or rolls back together with the state change that produced it.
#[async_trait]
pub trait InvoiceCreator: Send + Sync {
    async fn create_invoice(
        &self,
        conn: &mut PgConnection,
        request: &InvoiceRequest,
    ) -> Result<Uuid, SubscriptionError>;
}

/// Writes `invoices` and `invoice_line_items` rows.
#[derive(Debug, Clone, Default)]
pub struct PgInvoiceCreator;

fn invoice_number(invoice_id: Uuid) -> String {
    let simple = invoice_id.simple().to_string();
    format!(
        "INV-{}-{}",
        Utc::now().format("%Y%m%d"),
        simple[..8].to_uppercase()
    )
}

#[async_trait]
impl InvoiceCreator for PgInvoiceCreator {
    #[instrument(skip(self, conn, request), fields(subscription_id = %request.subscription_id))]
    async fn create_invoice(
        &self,
        conn: &mut PgConnection,
        request: &InvoiceRequest,
    ) -> Result<Uuid, SubscriptionError> {
        let _timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let invoice_id = Uuid::new_v4();
        let number = invoice_number(invoice_id);

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, invoice_number, user_id, subscription_id, invoice_type, subtotal, discount_amount, tax_percentage, tax_amount, total_amount, due_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(invoice_id)
        .bind(&number)
        .bind(request.user_id)
        .bind(request.subscription_id)
        .bind(request.invoice_type.as_str())
        .bind(request.subtotal().round_dp(2))
        .bind(request.discount_amount.round_dp(2))
        .bind(request.tax_percentage)
        .bind(request.tax_amount())
        .bind(request.total_amount())
        .bind(request.due_date)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to create invoice"))?;

        for (sort_order, item) in request.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (line_item_id, invoice_id, description, quantity, unit_price, amount, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price.round_dp(2))
            .bind(item.amount().round_dp(2))
            .bind(sort_order as i32)
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to create invoice line item"))?;
        }

        info!(%invoice_id, invoice_number = %number, "Invoice created");
        Ok(invoice_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_number_has_date_and_id_prefix() {
        let id = Uuid::parse_str("3f2b9c1e-0000-4000-8000-000000000000").unwrap();
        let number = invoice_number(id);

        assert!(number.starts_with("INV-"));
        assert!(number.ends_with("-3F2B9C1E"));
        assert_eq!(number.len(), "INV-20260101-3F2B9C1E".len());
    }
}
