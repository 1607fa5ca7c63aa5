//! Domain models for subscription-service.

mod entitlement;
mod history;
mod invoice;
mod pet;
mod pricing;
mod promo;
mod subscription;
mod tier;

pub use entitlement::{Entitlement, EntitlementCheck};
pub use history::{HistoryAction, NewHistoryEntry, SubscriptionHistory};
pub use invoice::{InvoiceLineItem, InvoiceRequest, InvoiceType};
pub use pet::{age_in_months, LifeStage, Pet};
pub use pricing::PriceBreakdown;
pub use promo::{DiscountType, PromoCode, PromoDecision};
pub use subscription::{
    CancellationOutcome, ChangeTierRequest, CreateSubscription, CreatedSubscription,
    DowngradeOutcome, NewSubscription, RenewalPreview, Subscription, SubscriptionStatus, TierChange,
    UpgradeOutcome,
};
pub use tier::{BillingCycle, SubscriptionTier, TierConfig};
