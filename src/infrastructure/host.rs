//! Adapters standing in for the host shop: customer lookup and order notes.

use crate::domain::plan::{CustomerId, OrderId};
use crate::domain::ports::{CustomerDirectory, OrderJournal};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// Customer emails known up front (imported from the host, or test fixtures).
#[derive(Debug, Default, Clone)]
pub struct StaticCustomerDirectory {
    emails: HashMap<CustomerId, String>,
}

impl StaticCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, customer_id: CustomerId, email: impl Into<String>) -> Self {
        self.emails.insert(customer_id, email.into());
        self
    }
}

#[async_trait]
impl CustomerDirectory for StaticCustomerDirectory {
    async fn email(&self, customer_id: CustomerId) -> Option<String> {
        self.emails.get(&customer_id).cloned()
    }
}

/// Writes order notes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOrderJournal;

#[async_trait]
impl OrderJournal for LoggingOrderJournal {
    async fn add_note(&self, order_id: OrderId, note: &str) {
        info!(order_id, note, "Order note");
    }
}

/// Keeps every note in memory.
#[derive(Debug, Default)]
pub struct RecordingOrderJournal {
    notes: Mutex<Vec<(OrderId, String)>>,
}

impl RecordingOrderJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<(OrderId, String)> {
        self.notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl OrderJournal for RecordingOrderJournal {
    async fn add_note(&self, order_id: OrderId, note: &str) {
        self.notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((order_id, note.to_string()));
    }
}
