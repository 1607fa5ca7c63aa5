//! Best-effort audit trail.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// One audited action.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub user_id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub changes_summary: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn subscription(user_id: Uuid, action: &str, subscription_id: Uuid) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            entity_type: "subscription".to_string(),
            entity_id: subscription_id,
            old_value: None,
            new_value: None,
            changes_summary: None,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_values<T: Serialize>(mut self, old: Option<&T>, new: Option<&T>) -> Self {
        self.old_value = old.and_then(|v| serde_json::to_value(v).ok());
        self.new_value = new.and_then(|v| serde_json::to_value(v).ok());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.changes_summary = Some(summary.into());
        self
    }
}

/// Records audit events. Implementations never fail the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: AuditEvent);
}

/// Writes `audit_logs` rows; failures are logged and dropped.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn log(&self, event: AuditEvent) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs (audit_id, user_id, action, entity_type, entity_id, old_value, new_value, changes_summary, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(&event.action)
        .bind(&event.entity_type)
        .bind(event.entity_id)
        .bind(&event.old_value)
        .bind(&event.new_value)
        .bind(&event.changes_summary)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(
                error = %e,
                action = %event.action,
                entity_id = %event.entity_id,
                "Failed to write audit log"
            );
        }
    }
}

/// Discards events.
#[derive(Debug, Clone, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn log(&self, _event: AuditEvent) {}
}
