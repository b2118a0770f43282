//! Subscription billing domain layer.
//!
//! Manages customers, plans, subscriptions, invoices, discounts, credits,
//! refunds, and quota tracking, and reconciles local state with an external
//! payment processor through webhook handlers. Consumed by transport
//! collaborators (HTTP controllers, schedulers); exposes no wire protocol
//! of its own.

pub mod config;
pub mod models;
pub mod services;
