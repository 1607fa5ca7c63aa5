//! Periodic background jobs.

mod scheduler;

pub use scheduler::{run_renewal_cycle, JobScheduler, RenewalSummary};
