//! Runtime configuration for plan creation, the scheduler and the outbound
//! integrations.

use crate::domain::money::Amount;
use crate::domain::retry::RetryPolicy;
use crate::domain::split::DEFAULT_FREQUENCY_DAYS;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use std::time::Duration;

/// When, and how, an order total is turned into an installment plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPolicy {
    /// Orders below this total are paid in one go and get no plan.
    pub min_total: Amount,
    pub installments_count: u32,
    pub frequency_days: u32,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            min_total: Amount::new(dec!(100.00)),
            installments_count: 3,
            frequency_days: DEFAULT_FREQUENCY_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on a single charge call.
    pub charge_timeout: Duration,
    /// Due payments fetched per page.
    pub batch_size: usize,
    /// Claims older than this are assumed abandoned by a crashed run.
    pub claim_ttl: Duration,
    pub retry_policy: RetryPolicy,
    /// Prefix turning a host customer id into a processor customer reference.
    pub customer_ref_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            charge_timeout: Duration::from_secs(30),
            batch_size: 100,
            claim_ttl: Duration::from_secs(15 * 60),
            retry_policy: RetryPolicy::default(),
            customer_ref_prefix: "cus_".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<SecretString>,
    pub timeout: Duration,
    pub currency: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout: Duration::from_secs(5),
            currency: "EUR".to_string(),
        }
    }
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            secret: Some(SecretString::from(secret.into())),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub currency: String,
    /// Transport-level timeout; the scheduler applies its own per-charge bound too.
    pub timeout: Duration,
}

impl ProcessorConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            currency: "EUR".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}
