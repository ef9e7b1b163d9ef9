//! Adapters behind the domain ports: storage, the charge processor, webhooks
//! and the host shop.

pub mod charge;
pub mod host;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod webhook;
