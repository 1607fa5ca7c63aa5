//! Pet-care subscription lifecycle, pricing and entitlement metering.
pub mod config;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
