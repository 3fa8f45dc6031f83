pub mod billing;

pub use billing::{BillingHandle, BillingScheduler, TickReport};
