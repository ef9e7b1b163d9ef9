//! Application layer: the two entry points the host calls.
//!
//! [`plan_creation::PlanCreationService`] runs on order completion and
//! [`scheduler::DuePaymentScheduler`] runs on a periodic trigger.

pub mod plan_creation;
pub mod scheduler;
