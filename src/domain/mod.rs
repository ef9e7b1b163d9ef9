//! Domain layer: billing entities, pure policies and the ports the application
//! layer talks through.

pub mod clock;
pub mod money;
pub mod payment;
pub mod plan;
pub mod ports;
pub mod retry;
pub mod split;
