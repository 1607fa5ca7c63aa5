pub mod audit;
pub mod database;
pub mod entitlements;
pub mod error;
pub mod invoice;
pub mod life_stage;
pub mod lifecycle;
pub mod metrics;
pub mod pricing;
pub mod promo;
pub mod proration;

pub use audit::{AuditEvent, AuditSink, NoopAuditSink, PgAuditSink};
pub use database::Database;
pub use entitlements::EntitlementManager;
pub use error::{ErrorKind, SubscriptionError};
pub use invoice::{InvoiceCreator, PgInvoiceCreator};
pub use life_stage::{LifeStageReconciler, LifeStageSummary};
pub use lifecycle::SubscriptionService;
pub use metrics::{get_metrics, init_metrics};
pub use pricing::PricingCalculator;
pub use promo::PromoValidator;
pub use proration::ProrationWindow;
