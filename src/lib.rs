//! Installment payment plans for shop orders.
//!
//! An order total is split into equal installments, the due ones are charged
//! off-session by a periodic scheduler run, failed charges are retried on a fixed
//! backoff table, and permanently failed installments are reported through a
//! signed webhook.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod telemetry;
