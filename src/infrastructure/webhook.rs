//! Signed webhook dispatch for permanently failed installments.

use crate::config::WebhookConfig;
use crate::domain::clock::Clock;
use crate::domain::ports::{CustomerDirectory, FailureNotifier, FinalFailure};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_NAME: &str = "payment.failed_final";
pub const EVENT_HEADER_VALUE: &str = "payment_failed_final";
pub const FALLBACK_EMAIL: &str = "unknown@example.com";

/// Header names used on outgoing notifications.
pub mod headers {
    pub const SIGNATURE: &str = "X-Signature";
    pub const EVENT: &str = "X-Event";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub event: String,
    pub timestamp: i64,
    pub data: FailureData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    pub plan_id: u64,
    pub order_id: u64,
    pub customer: CustomerInfo,
    pub debt: Debt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: u64,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debt {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub due_date: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl FailurePayload {
    pub fn build(
        failure: &FinalFailure,
        email: String,
        currency: &str,
        sent_at: DateTime<Utc>,
    ) -> Self {
        let FinalFailure { payment, plan } = failure;
        Self {
            event: EVENT_NAME.to_string(),
            timestamp: sent_at.timestamp(),
            data: FailureData {
                plan_id: plan.id,
                order_id: plan.order_id,
                customer: CustomerInfo {
                    id: plan.customer_id,
                    email,
                },
                debt: Debt {
                    amount: payment.amount.value(),
                    currency: currency.to_string(),
                    due_date: payment.due_date.format("%Y-%m-%d %H:%M:%S").to_string(),
                    attempts: payment.attempts,
                    last_error: payment.last_error.clone(),
                },
            },
        }
    }
}

/// Hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign_payload(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Notification(format!("HMAC key error: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a received `X-Signature` value in constant time.
pub fn verify_signature(body: &[u8], secret: &str, signature: &str) -> bool {
    let Ok(expected) = sign_payload(body, secret) else {
        return false;
    };
    constant_time_compare(expected.as_bytes(), signature.as_bytes())
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

struct Endpoint {
    url: String,
    secret: SecretString,
}

/// Posts a signed `payment.failed_final` event for every abandoned installment.
///
/// Each delivery runs on its own task; the caller never waits on the network.
/// A failed delivery is logged and dropped. Without a URL and a secret the
/// notifier does nothing.
#[derive(Clone)]
pub struct WebhookNotifier {
    endpoint: Option<Arc<Endpoint>>,
    currency: String,
    http_client: Client,
    directory: Arc<dyn CustomerDirectory>,
    clock: Arc<dyn Clock>,
    tracker: TaskTracker,
}

impl WebhookNotifier {
    pub fn new(
        config: &WebhookConfig,
        directory: Arc<dyn CustomerDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("installments/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let endpoint = match (&config.url, &config.secret) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.expose_secret().is_empty() => {
                Some(Arc::new(Endpoint {
                    url: url.clone(),
                    secret: secret.clone(),
                }))
            }
            _ => None,
        };

        Ok(Self {
            endpoint,
            currency: config.currency.clone(),
            http_client,
            directory,
            clock,
            tracker: TaskTracker::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Waits for every delivery spawned so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn deliver(
        http_client: Client,
        endpoint: Arc<Endpoint>,
        payload: FailurePayload,
        payment_id: u64,
    ) -> Result<()> {
        let body = serde_json::to_vec(&payload)?;
        let signature = sign_payload(&body, endpoint.secret.expose_secret())?;

        let response = http_client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(headers::SIGNATURE, signature)
            .header(headers::EVENT, EVENT_HEADER_VALUE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Notification(format!(
                "Webhook endpoint answered {}",
                status
            )));
        }

        debug!(payment_id, %status, "Webhook accepted");
        Ok(())
    }
}

#[async_trait]
impl FailureNotifier for WebhookNotifier {
    async fn payment_failed_final(&self, failure: FinalFailure) {
        let Some(endpoint) = self.endpoint.clone() else {
            debug!(
                payment_id = failure.payment.id,
                "Webhook not configured, skipping failure notification"
            );
            return;
        };

        let email = self
            .directory
            .email(failure.plan.customer_id)
            .await
            .unwrap_or_else(|| FALLBACK_EMAIL.to_string());
        let payload = FailurePayload::build(&failure, email, &self.currency, self.clock.now());
        let payment_id = failure.payment.id;
        let http_client = self.http_client.clone();

        self.tracker.spawn(async move {
            let url = endpoint.url.clone();
            match Self::deliver(http_client, endpoint, payload, payment_id).await {
                Ok(()) => info!(payment_id, %url, "Webhook sent"),
                Err(e) => warn!(payment_id, %url, error = %e, "Webhook delivery failed"),
            }
        });
    }
}
